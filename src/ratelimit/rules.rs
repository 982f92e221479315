//! Rate rules and rule set comparison.
//!
//! A rule names one key and the number of requests per minute it may pass.
//! Rule sets are compared as key → rate mappings, so ordering and repeated
//! entries in the source never count as a change.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::SourceError;

/// Burst capacity of every bucket, in tokens.
pub const DEFAULT_CAPACITY: f64 = 10.0;
/// Tokens taken by a single request.
pub const DEFAULT_COST: f64 = 1.0;

/// Allowed throughput for a single key.
///
/// Serialized as `{ "request": "<key>", "rate": <requests per minute> }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateRule {
    /// The request identifier this rule applies to
    #[serde(rename = "request")]
    pub key: String,
    /// Requests allowed per minute
    #[serde(rename = "rate")]
    pub rate_per_minute: f64,
}

impl RateRule {
    /// Create a new rule.
    pub fn new(key: impl Into<String>, rate_per_minute: f64) -> Self {
        Self {
            key: key.into(),
            rate_per_minute,
        }
    }

    /// Check that the rule can be turned into bucket parameters.
    pub fn validate(&self) -> Result<(), SourceError> {
        if self.key.is_empty() {
            return Err(SourceError::Parse("rule has an empty request key".to_string()));
        }
        if !self.rate_per_minute.is_finite() || self.rate_per_minute < 0.0 {
            return Err(SourceError::Parse(format!(
                "rule for '{}' has invalid rate {}",
                self.key, self.rate_per_minute
            )));
        }
        Ok(())
    }
}

/// Token bucket parameters derived from a rate rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    /// Maximum number of tokens held
    pub capacity: f64,
    /// Tokens added per second
    pub refill_per_second: f64,
    /// Tokens consumed per request
    pub cost: f64,
}

impl BucketParams {
    /// Derive bucket parameters from a per-minute rate.
    pub fn from_rate(rate_per_minute: f64) -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            refill_per_second: rate_per_minute / 60.0,
            cost: DEFAULT_COST,
        }
    }
}

/// The active rules as a key → rate mapping.
///
/// When a key repeats, the later occurrence wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    rates: HashMap<String, f64>,
}

impl RuleSet {
    /// Create an empty rule set. Every key is admitted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a rule set from rules in source order.
    pub fn from_rules<'a, I>(rules: I) -> Self
    where
        I: IntoIterator<Item = &'a RateRule>,
    {
        let rates = rules
            .into_iter()
            .map(|rule| (rule.key.clone(), rule.rate_per_minute))
            .collect();
        Self { rates }
    }

    /// Rate in requests per minute for a key, if it has a rule.
    pub fn rate(&self, key: &str) -> Option<f64> {
        self.rates.get(key).copied()
    }

    /// Bucket parameters for a key, if it has a rule.
    pub fn bucket_params(&self, key: &str) -> Option<BucketParams> {
        self.rate(key).map(BucketParams::from_rate)
    }

    /// Whether `key` has a rule.
    pub fn contains(&self, key: &str) -> bool {
        self.rates.contains_key(key)
    }

    /// Number of distinct keys with a rule.
    pub fn len(&self) -> usize {
        self.rates.len()
    }

    /// Whether no key has a rule, in which case every request is admitted.
    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// Iterate over `(key, rate)` pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.rates.iter().map(|(key, rate)| (key.as_str(), *rate))
    }
}

impl FromIterator<RateRule> for RuleSet {
    fn from_iter<T: IntoIterator<Item = RateRule>>(iter: T) -> Self {
        let rates = iter
            .into_iter()
            .map(|rule| (rule.key, rule.rate_per_minute))
            .collect();
        Self { rates }
    }
}

/// Returns `true` when both rule lists describe the same key → rate mapping.
pub fn compare_rules(old: &[RateRule], new: &[RateRule]) -> bool {
    RuleSet::from_rules(old) == RuleSet::from_rules(new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(entries: &[(&str, f64)]) -> Vec<RateRule> {
        entries
            .iter()
            .map(|(key, rate)| RateRule::new(*key, *rate))
            .collect()
    }

    #[test]
    fn test_bucket_params_from_rate() {
        let params = BucketParams::from_rate(60.0);
        assert_eq!(params.capacity, DEFAULT_CAPACITY);
        assert_eq!(params.refill_per_second, 1.0);
        assert_eq!(params.cost, DEFAULT_COST);

        let params = BucketParams::from_rate(120.0);
        assert_eq!(params.refill_per_second, 2.0);
        assert_eq!(params.capacity, 10.0);
    }

    #[test]
    fn test_compare_is_reflexive() {
        let a = rules(&[("/a", 60.0), ("/b", 120.0)]);
        assert!(compare_rules(&a, &a));
        assert!(compare_rules(&[], &[]));
    }

    #[test]
    fn test_compare_is_symmetric() {
        let a = rules(&[("/a", 60.0)]);
        let b = rules(&[("/a", 30.0)]);
        let c = rules(&[("/a", 60.0), ("/b", 1.0)]);

        assert_eq!(compare_rules(&a, &b), compare_rules(&b, &a));
        assert_eq!(compare_rules(&a, &c), compare_rules(&c, &a));
        assert!(!compare_rules(&a, &b));
        assert!(!compare_rules(&a, &c));
    }

    #[test]
    fn test_compare_ignores_order() {
        let a = rules(&[("/a", 60.0), ("/b", 120.0), ("/c", 5.0)]);
        let b = rules(&[("/c", 5.0), ("/a", 60.0), ("/b", 120.0)]);
        assert!(compare_rules(&a, &b));
    }

    #[test]
    fn test_compare_ignores_exact_duplicates() {
        let a = rules(&[("/a", 60.0), ("/b", 120.0)]);
        let b = rules(&[("/a", 60.0), ("/a", 60.0), ("/b", 120.0)]);
        assert!(compare_rules(&a, &b));
    }

    #[test]
    fn test_later_duplicate_wins() {
        let set = RuleSet::from_rules(&rules(&[("/a", 60.0), ("/a", 30.0)]));
        assert_eq!(set.len(), 1);
        assert_eq!(set.rate("/a"), Some(30.0));

        // Same mapping as a single rule with the later rate
        let a = rules(&[("/a", 60.0), ("/a", 30.0)]);
        let b = rules(&[("/a", 30.0)]);
        assert!(compare_rules(&a, &b));
    }

    #[test]
    fn test_rule_set_lookup() {
        let set: RuleSet = rules(&[("/api", 60.0)]).into_iter().collect();
        assert!(set.contains("/api"));
        assert!(!set.contains("/other"));
        assert_eq!(set.bucket_params("/api"), Some(BucketParams::from_rate(60.0)));
        assert_eq!(set.bucket_params("/other"), None);
        assert!(RuleSet::new().is_empty());
    }

    #[test]
    fn test_rule_validation() {
        assert!(RateRule::new("/a", 0.0).validate().is_ok());
        assert!(RateRule::new("/a", 60.0).validate().is_ok());
        assert!(matches!(
            RateRule::new("", 60.0).validate(),
            Err(SourceError::Parse(_))
        ));
        assert!(RateRule::new("/a", -1.0).validate().is_err());
        assert!(RateRule::new("/a", f64::NAN).validate().is_err());
        assert!(RateRule::new("/a", f64::INFINITY).validate().is_err());
    }

    #[test]
    fn test_rule_wire_shape() {
        let rule: RateRule = serde_json::from_str(r#"{"request": "/a", "rate": 60}"#).unwrap();
        assert_eq!(rule, RateRule::new("/a", 60.0));

        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["request"], "/a");
        assert_eq!(json["rate"], 60.0);
    }
}
