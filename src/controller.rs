//! Rule reload controller.
//!
//! The controller loads rules once at startup, then keeps them current from
//! two triggers: a periodic fetch from the config source and rule sets the
//! source pushes on its own. Both triggers run on the controller's single
//! task, so applies never interleave. A rule set is handed to the limiter only
//! when it differs from the active one, because every apply resets all
//! buckets.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{LimiterConfig, StartupPolicy};
use crate::error::{Result, SourceError};
use crate::ratelimit::{compare_rules, RateLimiter, RateRule, RuleSet};
use crate::source::ConfigSource;

/// Shortest reload interval the loop will tick at.
const MIN_RELOAD_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle of a [`ConfigController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Created, nothing loaded yet
    Idle,
    /// Initial load in progress or done, loop not started
    Bootstrapping,
    /// Reload loop running
    Running,
    /// Reload loop exited
    Stopped,
}

/// Keeps a [`RateLimiter`] in sync with a [`ConfigSource`].
pub struct ConfigController {
    limiter: Arc<RateLimiter>,
    source: Arc<dyn ConfigSource>,
    key: String,
    interval: Duration,
    policy: StartupPolicy,
    receiver: mpsc::Receiver<Vec<RateRule>>,
    /// Last rule list handed to the limiter
    active: Vec<RateRule>,
    state: ControllerState,
}

impl std::fmt::Debug for ConfigController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigController")
            .field("key", &self.key)
            .field("interval", &self.interval)
            .field("policy", &self.policy)
            .field("active_rules", &self.active.len())
            .field("state", &self.state)
            .finish()
    }
}

impl ConfigController {
    /// Create a controller and register its push channel with the source.
    pub fn new(
        limiter: Arc<RateLimiter>,
        source: Arc<dyn ConfigSource>,
        settings: &LimiterConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(settings.channel_capacity.max(1));
        source.register_config_channel(sender);

        let active = limiter
            .rules()
            .iter()
            .map(|(key, rate)| RateRule::new(key, rate))
            .collect();

        Self {
            limiter,
            source,
            key: settings.config_key.clone(),
            interval: settings.reload_interval().max(MIN_RELOAD_INTERVAL),
            policy: settings.startup_policy,
            receiver,
            active,
            state: ControllerState::Idle,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// The rule list most recently handed to the limiter, in source order.
    pub fn active_rules(&self) -> &[RateRule] {
        &self.active
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Interval between periodic reloads.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Perform the initial load.
    ///
    /// On failure, [`StartupPolicy::FailOpen`] continues with no rules and
    /// [`StartupPolicy::FailFast`] returns the error.
    pub async fn bootstrap(&mut self) -> Result<()> {
        self.state = ControllerState::Bootstrapping;
        info!(key = %self.key, "Loading initial rate rules");

        match self.reload().await {
            Ok(_) => {
                info!(
                    key = %self.key,
                    rules = self.limiter.rule_count(),
                    "Initial rate rules loaded"
                );
                Ok(())
            }
            Err(e) => match self.policy {
                StartupPolicy::FailOpen => {
                    error!(
                        key = %self.key,
                        error = %e,
                        "Failed to load initial rate rules, admitting all requests until the next successful reload"
                    );
                    self.install(Vec::new());
                    Ok(())
                }
                StartupPolicy::FailFast => {
                    error!(key = %self.key, error = %e, "Failed to load initial rate rules");
                    self.state = ControllerState::Idle;
                    Err(e.into())
                }
            },
        }
    }

    /// Fetch, parse and conditionally apply the rules from the source.
    ///
    /// Returns whether the limiter was reconfigured. On error the active
    /// rules are left as they are.
    pub async fn reload(&mut self) -> std::result::Result<bool, SourceError> {
        let raw = self.source.get_config(&self.key).await?;
        let rules = self.source.parse_config(&raw)?;
        self.apply(rules)
    }

    /// Hand `rules` to the limiter if they differ from the active set.
    ///
    /// Every rule is validated first. An invalid rule rejects the whole set
    /// and the active rules stay in place.
    pub fn apply(&mut self, rules: Vec<RateRule>) -> std::result::Result<bool, SourceError> {
        for rule in &rules {
            rule.validate()?;
        }
        Ok(self.install(rules))
    }

    fn install(&mut self, rules: Vec<RateRule>) -> bool {
        if compare_rules(&self.active, &rules) {
            debug!(key = %self.key, rules = rules.len(), "Rate rules unchanged");
            return false;
        }

        let rule_set = RuleSet::from_rules(&rules);
        let rule_count = rule_set.len();
        let applied = self.limiter.reconfigure(rule_set);
        self.active = rules;

        if applied {
            info!(
                key = %self.key,
                rules = rule_count,
                generation = self.limiter.generation(),
                "Applied new rate rules"
            );
        }
        applied
    }

    /// Run the reload loop until `shutdown` changes or its sender is dropped.
    ///
    /// Returns the controller so its final state can be inspected.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Self {
        self.state = ControllerState::Running;
        info!(
            key = %self.key,
            interval_secs = self.interval.as_secs_f64(),
            "Rate rule reload loop started"
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut push_open = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reload().await {
                        warn!(key = %self.key, error = %e, "Rate rule reload failed, keeping active rules");
                    }
                }
                pushed = self.receiver.recv(), if push_open => {
                    match pushed {
                        Some(rules) => {
                            debug!(key = %self.key, rules = rules.len(), "Received pushed rate rules");
                            if let Err(e) = self.apply(rules) {
                                warn!(key = %self.key, error = %e, "Rejected pushed rate rules, keeping active rules");
                            }
                        }
                        None => {
                            debug!(key = %self.key, "Config source closed its push channel");
                            push_open = false;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }

        self.state = ControllerState::Stopped;
        info!(key = %self.key, "Rate rule reload loop stopped");
        self
    }
}
