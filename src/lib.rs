//! Keyrate - Per-key Rate Limiting with Hot-Reloaded Rules
//!
//! This crate decides whether a request identified by a key (typically an
//! HTTP path) should be throttled. Each ruled key gets a token bucket, and the
//! rule set can be replaced at runtime from a pluggable config source without
//! restarting the process. Limits are enforced per process.

pub mod config;
pub mod controller;
pub mod error;
pub mod ratelimit;
pub mod source;

pub use controller::{ConfigController, ControllerState};
pub use ratelimit::RateLimiter;
