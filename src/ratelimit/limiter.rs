//! Core rate limiter implementation.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use super::bucket::TokenBucket;
use super::rules::RuleSet;

/// One complete snapshot of active rules and the buckets created under them.
#[derive(Debug)]
struct Generation {
    /// Monotonic generation number, 0 for the initial set
    id: u64,
    /// Active rules
    rules: RuleSet,
    /// Buckets created lazily for ruled keys
    buckets: DashMap<String, Arc<TokenBucket>>,
}

impl Generation {
    fn new(id: u64, rules: RuleSet) -> Self {
        Self {
            id,
            rules,
            buckets: DashMap::new(),
        }
    }
}

/// The rate limiter engine.
///
/// Owns the active generation of rules and buckets. Decisions hold the
/// generation lock in read mode for their whole duration, and reconfiguration
/// swaps the generation under the write lock, so every decision sees rules and
/// buckets from the same generation. The generation lock is always taken
/// before any bucket lock.
///
/// This struct is thread-safe and is shared across tasks behind an `Arc`.
#[derive(Debug)]
pub struct RateLimiter {
    generation: RwLock<Generation>,
}

impl RateLimiter {
    /// Create a rate limiter with no rules. Every key is admitted.
    pub fn new() -> Self {
        Self::with_rules(RuleSet::new())
    }

    /// Create a rate limiter with an initial rule set.
    pub fn with_rules(rules: RuleSet) -> Self {
        Self {
            generation: RwLock::new(Generation::new(0, rules)),
        }
    }

    /// Decide whether a request for `key` must be throttled.
    ///
    /// Returns `true` when the request is over its limit. Keys without a rule
    /// are never limited and never get a bucket.
    pub fn decide(&self, key: &str) -> bool {
        self.decide_at(key, None, Instant::now())
    }

    /// Like [`RateLimiter::decide`], with an explicit token cost.
    pub fn decide_with_cost(&self, key: &str, cost: f64) -> bool {
        self.decide_at(key, Some(cost), Instant::now())
    }

    /// Decide against an explicit clock reading.
    ///
    /// `cost` falls back to the per-request cost of the key's bucket, as does
    /// a negative or non-finite `cost`.
    pub fn decide_at(&self, key: &str, cost: Option<f64>, now: Instant) -> bool {
        let generation = self.generation.read();

        let Some(params) = generation.rules.bucket_params(key) else {
            trace!(key = %key, "No rule for key, admitting");
            return false;
        };

        let existing = generation.buckets.get(key).map(|bucket| bucket.value().clone());
        let bucket = match existing {
            Some(bucket) => bucket,
            None => generation
                .buckets
                .entry(key.to_string())
                .or_insert_with(|| {
                    debug!(
                        key = %key,
                        generation = generation.id,
                        capacity = params.capacity,
                        refill_per_second = params.refill_per_second,
                        "Creating token bucket"
                    );
                    Arc::new(TokenBucket::new(params, now))
                })
                .value()
                .clone(),
        };

        let cost = match cost {
            Some(cost) if cost.is_finite() && cost >= 0.0 => cost,
            Some(cost) => {
                warn!(key = %key, cost = cost, "Invalid request cost, using the default");
                params.cost
            }
            None => params.cost,
        };
        let limited = !bucket.try_consume(now, cost);

        if limited {
            debug!(key = %key, cost = cost, "Rate limit exceeded");
        } else {
            trace!(key = %key, cost = cost, "Request admitted");
        }

        limited
    }

    /// Replace the active rules.
    ///
    /// A rule set equal to the active one leaves everything untouched and
    /// returns `false`. Otherwise a new generation with no buckets is
    /// published and `true` is returned.
    pub fn reconfigure(&self, rules: RuleSet) -> bool {
        let mut generation = self.generation.write();

        if generation.rules == rules {
            trace!(generation = generation.id, "Rule set unchanged, keeping buckets");
            return false;
        }

        let next = Generation::new(generation.id + 1, rules);
        let previous = std::mem::replace(&mut *generation, next);
        let (id, rule_count) = (generation.id, generation.rules.len());
        drop(generation);

        info!(
            generation = id,
            rules = rule_count,
            discarded_buckets = previous.buckets.len(),
            "Rate limiter reconfigured"
        );
        true
    }

    /// Snapshot of the active rules.
    pub fn rules(&self) -> RuleSet {
        self.generation.read().rules.clone()
    }

    /// Rate in requests per minute for a key, if it has a rule.
    pub fn rate(&self, key: &str) -> Option<f64> {
        self.generation.read().rules.rate(key)
    }

    /// Get the number of active rules.
    pub fn rule_count(&self) -> usize {
        self.generation.read().rules.len()
    }

    /// Get the number of buckets created in the active generation.
    pub fn bucket_count(&self) -> usize {
        self.generation.read().buckets.len()
    }

    /// Get the active generation number.
    pub fn generation(&self) -> u64 {
        self.generation.read().id
    }

    /// Tokens left in a key's bucket, if the bucket exists.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        self.generation
            .read()
            .buckets
            .get(key)
            .map(|bucket| bucket.tokens())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
