//! Rate limiting logic and state management.

mod bucket;
mod limiter;
mod rules;

pub use bucket::TokenBucket;
pub use limiter::RateLimiter;
pub use rules::{compare_rules, BucketParams, RateRule, RuleSet, DEFAULT_CAPACITY, DEFAULT_COST};
