//! File-backed config source.
//!
//! The file is YAML (or JSON) with a top-level mapping from lookup key to a
//! mapping of named entries:
//!
//! ```yaml
//! ratelimit:
//!   public: '[{"request": "/a", "rate": 60}]'
//!   admin:
//!     request: /admin
//!     rate: 5
//! ```
//!
//! String entries are passed through as rule documents, structured entries
//! are re-encoded as JSON.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{ConfigSource, RawConfig, RuleSender};
use crate::error::SourceError;

/// Default interval between modification checks in the daemon.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// What happened to a rule set the daemon tried to push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushOutcome {
    Sent,
    /// No channel registered yet
    Unregistered,
    /// The receiving end is gone
    Closed,
}

/// A config source reading rules from a local file.
///
/// `get_config` re-reads the file on every call. When a watch key is set, the
/// daemon polls the file's modification time and pushes freshly parsed rules
/// to the registered channel whenever it changes.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    watch_key: Option<String>,
    poll_interval: Duration,
    sender: Mutex<Option<RuleSender>>,
}

impl FileSource {
    /// Create a source for the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            watch_key: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            sender: Mutex::new(None),
        }
    }

    /// Let the daemon watch the file and push rules stored under `key`.
    pub fn with_watch(mut self, key: impl Into<String>, poll_interval: Duration) -> Self {
        self.watch_key = Some(key.into());
        self.poll_interval = poll_interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.path)
            .await
            .and_then(|meta| meta.modified())
            .ok()
    }

    /// Fetch, parse and push the rules under `key`.
    async fn push_rules(&self, key: &str) -> Result<PushOutcome, SourceError> {
        let raw = self.get_config(key).await?;
        let rules = self.parse_config(&raw)?;

        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            return Ok(PushOutcome::Unregistered);
        };
        match sender.send(rules).await {
            Ok(()) => Ok(PushOutcome::Sent),
            Err(_) => Ok(PushOutcome::Closed),
        }
    }
}

/// Convert one entry of the file into a rule document string.
fn entry_to_document(name: &str, value: serde_yaml::Value) -> Result<String, SourceError> {
    match value {
        serde_yaml::Value::String(document) => Ok(document),
        other => serde_json::to_string(&other)
            .map_err(|e| SourceError::Parse(format!("entry '{}': {}", name, e))),
    }
}

#[async_trait]
impl ConfigSource for FileSource {
    async fn get_config(&self, key: &str) -> Result<RawConfig, SourceError> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SourceError::Fetch(format!("failed to read {}: {}", self.path.display(), e))
        })?;

        let mut document: serde_yaml::Mapping = serde_yaml::from_str(&contents).map_err(|e| {
            SourceError::Parse(format!("failed to decode {}: {}", self.path.display(), e))
        })?;

        let entries = match document.remove(key) {
            Some(serde_yaml::Value::Mapping(entries)) => entries,
            Some(serde_yaml::Value::Null) => serde_yaml::Mapping::new(),
            Some(_) => {
                return Err(SourceError::Parse(format!(
                    "key '{}' in {} is not a mapping",
                    key,
                    self.path.display()
                )))
            }
            None => {
                return Err(SourceError::Fetch(format!(
                    "key '{}' not found in {}",
                    key,
                    self.path.display()
                )))
            }
        };

        let mut raw = RawConfig::new();
        for (name, value) in entries {
            let name = match name {
                serde_yaml::Value::String(name) => name,
                other => {
                    return Err(SourceError::Parse(format!(
                        "entry name {:?} under '{}' is not a string",
                        other, key
                    )))
                }
            };
            let document = entry_to_document(&name, value)?;
            raw.insert(name, document);
        }

        debug!(path = %self.path.display(), key = %key, entries = raw.len(), "Read rule file");
        Ok(raw)
    }

    fn register_config_channel(&self, sender: RuleSender) {
        *self.sender.lock() = Some(sender);
    }

    async fn daemon(&self, mut shutdown: watch::Receiver<bool>) {
        let Some(key) = self.watch_key.as_deref() else {
            return;
        };

        info!(
            path = %self.path.display(),
            key = %key,
            interval_ms = self.poll_interval.as_millis() as u64,
            "Watching rule file"
        );

        let mut last_modified = self.modified().await;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let modified = self.modified().await;
                    if modified.is_none() || modified == last_modified {
                        continue;
                    }

                    match self.push_rules(key).await {
                        Ok(PushOutcome::Sent) => {
                            debug!(path = %self.path.display(), "Pushed rules from changed file");
                            last_modified = modified;
                        }
                        // Leave the change pending so it is pushed once a channel exists
                        Ok(PushOutcome::Unregistered) => {
                            debug!(path = %self.path.display(), "No config channel registered, holding changed rules");
                        }
                        Ok(PushOutcome::Closed) => {
                            debug!("Config channel closed, stopping file watch");
                            return;
                        }
                        Err(e) => {
                            warn!(path = %self.path.display(), error = %e, "Failed to load changed rule file");
                            last_modified = modified;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!(path = %self.path.display(), "Stopping file watch");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateRule;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio::sync::mpsc;

    fn write_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_read_string_and_structured_entries() {
        let file = write_file(
            r#"
ratelimit:
  public: '[{"request": "/a", "rate": 60}, {"request": "/b", "rate": 120}]'
  admin:
    request: /admin
    rate: 5
"#,
        );
        let source = FileSource::new(file.path());

        let raw = source.get_config("ratelimit").await.unwrap();
        assert_eq!(raw.len(), 2);

        let rules = source.parse_config(&raw).unwrap();
        assert_eq!(
            rules,
            vec![
                RateRule::new("/admin", 5.0),
                RateRule::new("/a", 60.0),
                RateRule::new("/b", 120.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_read_json_file() {
        let file = write_file(r#"{"limits": {"api": {"request": "/api", "rate": 30}}}"#);
        let source = FileSource::new(file.path());

        let raw = source.get_config("limits").await.unwrap();
        let rules = source.parse_config(&raw).unwrap();
        assert_eq!(rules, vec![RateRule::new("/api", 30.0)]);
    }

    #[tokio::test]
    async fn test_empty_key_yields_no_rules() {
        let file = write_file("ratelimit:\n");
        let source = FileSource::new(file.path());

        let raw = source.get_config("ratelimit").await.unwrap();
        assert!(raw.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_fetch_error() {
        let source = FileSource::new("/nonexistent/keyrate/rules.yaml");
        let err = source.get_config("ratelimit").await.unwrap_err();
        assert!(matches!(err, SourceError::Fetch(_)));
    }

    #[tokio::test]
    async fn test_missing_key_is_fetch_error() {
        let file = write_file("other:\n  a: '[]'\n");
        let source = FileSource::new(file.path());
        let err = source.get_config("ratelimit").await.unwrap_err();
        assert!(matches!(err, SourceError::Fetch(_)));
    }

    #[tokio::test]
    async fn test_malformed_file_is_parse_error() {
        let file = write_file("ratelimit: [not, a, mapping]\n");
        let source = FileSource::new(file.path());
        let err = source.get_config("ratelimit").await.unwrap_err();
        assert!(matches!(err, SourceError::Parse(_)));

        let file = write_file("- just\n- a list\n");
        let source = FileSource::new(file.path());
        let err = source.get_config("ratelimit").await.unwrap_err();
        assert!(matches!(err, SourceError::Parse(_)));
    }

    #[tokio::test]
    async fn test_daemon_without_watch_key_returns() {
        let file = write_file("ratelimit:\n");
        let source = FileSource::new(file.path());
        let (_tx, rx) = watch::channel(false);

        // Completes immediately instead of polling forever
        source.daemon(rx).await;
    }

    #[tokio::test]
    async fn test_push_outcome_distinguishes_missing_and_closed_channel() {
        let file = write_file("ratelimit:\n  a: '{\"request\": \"/a\", \"rate\": 60}'\n");
        let source = FileSource::new(file.path());

        assert_eq!(source.push_rules("ratelimit").await, Ok(PushOutcome::Unregistered));

        let (tx, mut rx) = mpsc::channel(4);
        source.register_config_channel(tx);
        assert_eq!(source.push_rules("ratelimit").await, Ok(PushOutcome::Sent));
        assert_eq!(rx.recv().await, Some(vec![RateRule::new("/a", 60.0)]));

        drop(rx);
        assert_eq!(source.push_rules("ratelimit").await, Ok(PushOutcome::Closed));
    }

    #[tokio::test]
    async fn test_daemon_keeps_watching_until_channel_registered() {
        let file = write_file("ratelimit:\n  a: '{\"request\": \"/a\", \"rate\": 60}'\n");
        let source = std::sync::Arc::new(
            FileSource::new(file.path()).with_watch("ratelimit", Duration::from_millis(20)),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let daemon = {
            let source = source.clone();
            tokio::spawn(async move { source.daemon(shutdown_rx).await })
        };

        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(
            file.path(),
            "ratelimit:\n  a: '{\"request\": \"/a\", \"rate\": 30}'\n",
        )
        .unwrap();

        // Several polls see the change with nowhere to send it
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!daemon.is_finished());

        let (tx, mut rx) = mpsc::channel(4);
        source.register_config_channel(tx);
        let pushed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(pushed, Some(vec![RateRule::new("/a", 30.0)]));

        shutdown_tx.send(true).unwrap();
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_daemon_pushes_on_change() {
        let file = write_file("ratelimit:\n  a: '{\"request\": \"/a\", \"rate\": 60}'\n");
        let source = std::sync::Arc::new(
            FileSource::new(file.path()).with_watch("ratelimit", Duration::from_millis(20)),
        );
        let (tx, mut rx) = mpsc::channel(4);
        source.register_config_channel(tx);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let daemon = {
            let source = source.clone();
            tokio::spawn(async move { source.daemon(shutdown_rx).await })
        };

        // Make sure the new modification time differs from the initial one
        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(
            file.path(),
            "ratelimit:\n  a: '{\"request\": \"/a\", \"rate\": 30}'\n",
        )
        .unwrap();

        let pushed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(pushed, Some(vec![RateRule::new("/a", 30.0)]));

        shutdown_tx.send(true).unwrap();
        daemon.await.unwrap();
    }
}
