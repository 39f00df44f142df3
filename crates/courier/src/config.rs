//! Configuration for the mail core.
//!
//! All settings have sensible defaults. Configuration is loaded from
//! environment variables prefixed with `COURIER_` or falls back to
//! compiled-in defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default trash retention before a purge fires.
pub const DEFAULT_TRASH_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default cadence of the inbox subscription poller.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Top-level mail core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// SQLite store settings.
    pub store: StoreConfig,
    /// How long trashed messages are kept before permanent deletion.
    /// A zero value is replaced by the 30-day default.
    #[serde(with = "duration_secs")]
    pub trash_retention: Duration,
    /// Cadence of the inbox subscription poller.
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Buffer size of inbox subscription delivery channels.
    pub subscription_buffer: usize,
}

/// SQLite store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            trash_retention: DEFAULT_TRASH_RETENTION,
            poll_interval: DEFAULT_POLL_INTERVAL,
            subscription_buffer: 64,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("courier.db"),
        }
    }
}

impl MailConfig {
    /// Load config, applying environment-variable overrides on top of defaults.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("COURIER_DB_PATH") {
            cfg.store.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("COURIER_TRASH_RETENTION_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                cfg.trash_retention = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("COURIER_POLL_INTERVAL_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.poll_interval = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("COURIER_SUBSCRIPTION_BUFFER") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.subscription_buffer = n;
            }
        }

        cfg.normalize()
    }

    /// Replace degenerate settings with their defaults.
    pub fn normalize(mut self) -> Self {
        if self.trash_retention.is_zero() {
            self.trash_retention = DEFAULT_TRASH_RETENTION;
        }
        if self.poll_interval.is_zero() {
            self.poll_interval = DEFAULT_POLL_INTERVAL;
        }
        if self.subscription_buffer == 0 {
            self.subscription_buffer = 64;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// duration_secs: serde shim for `Duration` as whole seconds
// ---------------------------------------------------------------------------

mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
