//! In-memory config source.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::{ConfigSource, RawConfig, RuleSender};
use crate::error::SourceError;
use crate::ratelimit::RateRule;

/// Entry name used by [`MemorySource::set_rules`].
const RULES_ENTRY: &str = "rules";

/// A config source backed by process memory.
///
/// Raw configurations can be replaced at any time and rule sets can be pushed
/// straight to the registered channel. Useful for embedding and for tests.
#[derive(Debug, Default)]
pub struct MemorySource {
    configs: RwLock<HashMap<String, RawConfig>>,
    sender: Mutex<Option<RuleSender>>,
}

impl MemorySource {
    /// Create an empty source. Every lookup fails until a config is set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw configuration under `key`.
    pub fn set(&self, key: impl Into<String>, raw: RawConfig) {
        self.configs.write().insert(key.into(), raw);
    }

    /// Store `rules` under `key`, encoded as a single rule list entry.
    pub fn set_rules(&self, key: impl Into<String>, rules: &[RateRule]) -> Result<(), SourceError> {
        let document =
            serde_json::to_string(rules).map_err(|e| SourceError::Parse(e.to_string()))?;
        let mut raw = RawConfig::new();
        raw.insert(RULES_ENTRY.to_string(), document);
        self.set(key, raw);
        Ok(())
    }

    /// Remove the configuration stored under `key`.
    pub fn remove(&self, key: &str) -> Option<RawConfig> {
        self.configs.write().remove(key)
    }

    /// Push a parsed rule set to the registered channel.
    ///
    /// Returns `false` when no channel is registered or the receiver is gone.
    pub async fn push(&self, rules: Vec<RateRule>) -> bool {
        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            warn!("No config channel registered, dropping pushed rules");
            return false;
        };

        debug!(rules = rules.len(), "Pushing rule set");
        sender.send(rules).await.is_ok()
    }
}

#[async_trait]
impl ConfigSource for MemorySource {
    async fn get_config(&self, key: &str) -> Result<RawConfig, SourceError> {
        self.configs
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| SourceError::Fetch(format!("key '{}' not found", key)))
    }

    fn register_config_channel(&self, sender: RuleSender) {
        *self.sender.lock() = Some(sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_get_missing_key() {
        let source = MemorySource::new();
        let err = tokio_test::block_on(source.get_config("limits")).unwrap_err();
        assert!(matches!(err, SourceError::Fetch(_)));
    }

    #[test]
    fn test_set_replaces_previous_config() {
        let source = MemorySource::new();
        source.set_rules("limits", &[RateRule::new("/a", 1.0)]).unwrap();
        source.set_rules("limits", &[RateRule::new("/b", 2.0)]).unwrap();

        let raw = tokio_test::assert_ok!(tokio_test::block_on(source.get_config("limits")));
        let rules = tokio_test::assert_ok!(source.parse_config(&raw));
        assert_eq!(rules, vec![RateRule::new("/b", 2.0)]);
    }

    #[tokio::test]
    async fn test_set_rules_round_trips_through_parser() {
        let source = MemorySource::new();
        let rules = vec![RateRule::new("/a", 60.0), RateRule::new("/b", 120.0)];
        source.set_rules("limits", &rules).unwrap();

        let raw = source.get_config("limits").await.unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(source.parse_config(&raw).unwrap(), rules);

        source.remove("limits");
        assert!(source.get_config("limits").await.is_err());
    }

    #[tokio::test]
    async fn test_push_without_channel() {
        let source = MemorySource::new();
        assert!(!source.push(vec![RateRule::new("/a", 1.0)]).await);
    }

    #[tokio::test]
    async fn test_push_through_registered_channel() {
        let source = MemorySource::new();
        let (tx, mut rx) = mpsc::channel(4);
        source.register_config_channel(tx);

        assert!(source.push(vec![RateRule::new("/a", 1.0)]).await);
        assert_eq!(rx.recv().await, Some(vec![RateRule::new("/a", 1.0)]));

        drop(rx);
        assert!(!source.push(vec![]).await);
    }
}
