//! Configuration layer: typed settings with layered precedence (file → env).

use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

use crate::retry::RetryPolicy;

const DEFAULT_QUERY_CAPACITY: usize = 256;
const DEFAULT_TTL_MS: u64 = 5 * 60 * 1000;
const DEFAULT_STALE_AFTER_MS: u64 = 30 * 1000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_FETCH_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 250;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;
const DEFAULT_RETRY_JITTER_MS: u64 = 100;
const DEFAULT_REALTIME_INITIAL_DELAY_MS: u64 = 500;
const ENV_PREFIX: &str = "SYNCLINE";

/// Errors raised while loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl SettingsError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// Synchronization layer settings.
///
/// Every field has a default; a host application can construct this
/// directly, deserialize it from its own config tree, or use
/// [`SyncSettings::load`] for file + environment layering.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Maximum entries in the query cache.
    pub query_capacity: usize,
    /// Hard expiry for cached entries (ms).
    pub default_ttl_ms: u64,
    /// Soft expiry for cached entries (ms); must not exceed the TTL.
    pub default_stale_after_ms: u64,
    /// Client-side bound on each backend call (ms).
    pub request_timeout_ms: u64,
    /// Attempt budget for fetches and mutations.
    pub fetch_max_attempts: u32,
    /// First retry delay (ms).
    pub retry_initial_delay_ms: u64,
    /// Retry delay cap (ms).
    pub retry_max_delay_ms: u64,
    /// Exponential growth factor between retries.
    pub retry_multiplier: f64,
    /// Jitter window added to every delay (ms).
    pub retry_jitter_ms: u64,
    /// First reconnect delay for realtime channels (ms).
    pub realtime_initial_delay_ms: u64,
    pub logging: LoggingSettings,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            query_capacity: DEFAULT_QUERY_CAPACITY,
            default_ttl_ms: DEFAULT_TTL_MS,
            default_stale_after_ms: DEFAULT_STALE_AFTER_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            fetch_max_attempts: DEFAULT_FETCH_MAX_ATTEMPTS,
            retry_initial_delay_ms: DEFAULT_RETRY_INITIAL_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            retry_multiplier: DEFAULT_RETRY_MULTIPLIER,
            retry_jitter_ms: DEFAULT_RETRY_JITTER_MS,
            realtime_initial_delay_ms: DEFAULT_REALTIME_INITIAL_DELAY_MS,
            logging: LoggingSettings::default(),
        }
    }
}

impl SyncSettings {
    /// Load settings from an optional TOML file, overridden by
    /// `SYNCLINE_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings: Self = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the cache and retry layers cannot honor.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.query_capacity == 0 {
            return Err(SettingsError::invalid("query_capacity must be at least 1"));
        }
        if self.default_stale_after_ms > self.default_ttl_ms {
            return Err(SettingsError::invalid(
                "default_stale_after_ms must not exceed default_ttl_ms",
            ));
        }
        if self.fetch_max_attempts == 0 {
            return Err(SettingsError::invalid(
                "fetch_max_attempts must be at least 1",
            ));
        }
        if self.retry_multiplier < 1.0 {
            return Err(SettingsError::invalid(
                "retry_multiplier must be at least 1.0",
            ));
        }
        Ok(())
    }

    pub fn query_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.query_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn default_stale_after(&self) -> Duration {
        Duration::from_millis(self.default_stale_after_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Bounded policy for fetches and mutations.
    pub fn fetch_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.fetch_max_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            multiplier: self.retry_multiplier,
            jitter: Duration::from_millis(self.retry_jitter_ms),
        }
    }

    /// Policy for realtime reconnection; the manager retries without an
    /// attempt bound, using only the delay curve.
    pub fn realtime_retry(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.realtime_initial_delay_ms),
            ..self.fetch_retry()
        }
    }
}

/// Logging settings consumed by [`telemetry::init`].
///
/// [`telemetry::init`]: crate::telemetry::init
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default tracing directive, e.g. `info` or `syncline=debug`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Compact,
}
