//! Agent configuration.
//!
//! Settings come from three layers, later layers winning:
//! built-in defaults < `config.toml` in the data directory < `KN_*`
//! environment variables. All tunables have conservative defaults so a
//! bare `kn agent run` works without any configuration file.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

use crate::{Error, Result};

/// Tunables for the scheduling agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Seconds between poll cycles in `kn agent run`.
    pub poll_interval_secs: u64,

    /// How far ahead of "now" the Scan stage looks for candidates, in
    /// seconds. Usually matches the poll interval.
    pub lookahead_secs: u64,

    /// Days after the due time during which a reminder is still worth
    /// sending; past this the reminder expires silently.
    pub grace_period_days: i64,

    /// Maximum delivery attempts per occurrence, including the first.
    pub max_delivery_attempts: u32,

    /// Base delay for exponential backoff between delivery attempts, in
    /// milliseconds. Attempt n waits `retry_base_ms * 2^(n-1)`.
    pub retry_base_ms: u64,

    /// Per-dispatch timeout, in seconds. A dispatch past its budget is a
    /// transient failure; this also bounds how long one stuck item can
    /// hold up a cycle.
    pub dispatch_timeout_secs: u64,

    /// Days committed ledger records are retained before `kn ledger
    /// sweep` removes them.
    pub ledger_retention_days: i64,

    /// Notification service endpoint. When unset, notifications are
    /// rendered to the log instead.
    pub webhook_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
            lookahead_secs: 300,
            grace_period_days: 7,
            max_delivery_attempts: 3,
            retry_base_ms: 500,
            dispatch_timeout_secs: 10,
            ledger_retention_days: 90,
            webhook_url: None,
        }
    }
}

impl Settings {
    /// Load settings for the given data directory.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let mut settings = Self::default();

        let config_path = data_dir.join("config.toml");
        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)?;
            settings = toml::from_str(&raw)
                .map_err(|e| Error::InvalidInput(format!("config.toml: {}", e)))?;
        }

        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `KN_*` environment overrides.
    fn apply_env(&mut self) {
        read_env("KN_POLL_INTERVAL_SECS", &mut self.poll_interval_secs);
        read_env("KN_LOOKAHEAD_SECS", &mut self.lookahead_secs);
        read_env("KN_GRACE_PERIOD_DAYS", &mut self.grace_period_days);
        read_env("KN_MAX_DELIVERY_ATTEMPTS", &mut self.max_delivery_attempts);
        read_env("KN_RETRY_BASE_MS", &mut self.retry_base_ms);
        read_env("KN_DISPATCH_TIMEOUT_SECS", &mut self.dispatch_timeout_secs);
        read_env("KN_LEDGER_RETENTION_DAYS", &mut self.ledger_retention_days);
        if let Ok(url) = env::var("KN_WEBHOOK_URL") {
            if !url.is_empty() {
                self.webhook_url = Some(url);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_delivery_attempts == 0 {
            return Err(Error::InvalidInput(
                "max_delivery_attempts must be >= 1".to_string(),
            ));
        }
        if self.grace_period_days < 0 || self.ledger_retention_days < 0 {
            return Err(Error::InvalidInput(
                "grace and retention periods must be non-negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Grace period as a chrono duration.
    pub fn grace_period(&self) -> Duration {
        Duration::days(self.grace_period_days)
    }

    /// Lookahead window as a chrono duration.
    pub fn lookahead(&self) -> Duration {
        Duration::seconds(self.lookahead_secs as i64)
    }

    /// Ledger retention as a chrono duration.
    pub fn ledger_retention(&self) -> Duration {
        Duration::days(self.ledger_retention_days)
    }
}

fn read_env<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = env::var(key) {
        if let Ok(value) = raw.parse() {
            *slot = value;
        } else {
            tracing::warn!(%key, %raw, "ignoring unparsable environment override");
        }
    }
}
