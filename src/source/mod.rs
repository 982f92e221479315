//! Config sources for rate rules.
//!
//! A source hands out raw configuration for a lookup key, turns it into rate
//! rules, and may push already parsed rule sets to the controller on its own
//! schedule. The controller only depends on the [`ConfigSource`] trait, so
//! backends can be swapped without touching the limiter.

mod file;
mod memory;

pub use file::FileSource;
pub use memory::MemorySource;

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::error::SourceError;
use crate::ratelimit::RateRule;

/// Raw configuration as stored by a backend: entry name → rule document.
///
/// Entries are parsed in ascending name order.
pub type RawConfig = BTreeMap<String, String>;

/// Channel end a source uses to push parsed rule sets.
pub type RuleSender = mpsc::Sender<Vec<RateRule>>;

/// Capabilities a rule backend provides to the controller.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetch the raw configuration stored under `key`.
    async fn get_config(&self, key: &str) -> Result<RawConfig, SourceError>;

    /// Turn raw configuration into rules, in source order.
    fn parse_config(&self, raw: &RawConfig) -> Result<Vec<RateRule>, SourceError> {
        parse_rules(raw)
    }

    /// Hand the source a channel for pushing parsed rule sets.
    ///
    /// Sources that never push can ignore it.
    fn register_config_channel(&self, _sender: RuleSender) {}

    /// Background work owned by the source, run until `shutdown` flips.
    async fn daemon(&self, _shutdown: watch::Receiver<bool>) {}
}

/// A single rule or a list of rules.
#[derive(Deserialize)]
#[serde(untagged)]
enum RuleDocument {
    One(RateRule),
    Many(Vec<RateRule>),
}

/// Parse every entry of a raw configuration as a JSON rule document.
///
/// Each value holds either one `{"request": .., "rate": ..}` object or an
/// array of them. When a key appears more than once, the later rule wins.
pub fn parse_rules(raw: &RawConfig) -> Result<Vec<RateRule>, SourceError> {
    let mut rules = Vec::new();
    let mut seen = HashSet::new();

    for (name, document) in raw {
        let document: RuleDocument = serde_json::from_str(document)
            .map_err(|e| SourceError::Parse(format!("entry '{}': {}", name, e)))?;

        let entries = match document {
            RuleDocument::One(rule) => vec![rule],
            RuleDocument::Many(rules) => rules,
        };

        for rule in entries {
            rule.validate().map_err(|e| match e {
                SourceError::Parse(msg) => SourceError::Parse(format!("entry '{}': {}", name, msg)),
                other => other,
            })?;

            if !seen.insert(rule.key.clone()) {
                warn!(
                    entry = %name,
                    key = %rule.key,
                    rate = rule.rate_per_minute,
                    "Duplicate rule, the later occurrence wins"
                );
            }
            rules.push(rule);
        }
    }

    Ok(rules)
}
