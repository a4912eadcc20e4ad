//! Telemetry bootstrap: tracing subscriber and metric descriptions.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log level `{level}`")]
    Level { level: String },
    #[error("failed to install tracing subscriber: {message}")]
    Install { message: String },
}

/// Install a global tracing subscriber using the provided logging
/// settings and register metric descriptions. Call once at application
/// start; host applications that install their own subscriber should
/// call [`describe_metrics`] alone.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
    describe_metrics();

    let level: LevelFilter = logging.level.parse().map_err(|_| TelemetryError::Level {
        level: logging.level.clone(),
    })?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| TelemetryError::Install {
            message: err.to_string(),
        })
}

/// Register descriptions for every metric the layer emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "syncline_cache_hit_total",
            Unit::Count,
            "Total number of query cache hits."
        );
        describe_counter!(
            "syncline_cache_miss_total",
            Unit::Count,
            "Total number of query cache misses."
        );
        describe_counter!(
            "syncline_cache_evict_total",
            Unit::Count,
            "Total number of query cache evictions due to capacity or expiry."
        );
        describe_counter!(
            "syncline_cache_stale_hit_total",
            Unit::Count,
            "Total number of query cache hits served past their soft expiry."
        );
        describe_counter!(
            "syncline_realtime_reconnect_total",
            Unit::Count,
            "Total number of realtime channel reconnect attempts."
        );
        describe_gauge!(
            "syncline_realtime_channels_active",
            Unit::Count,
            "Currently open realtime channels."
        );
        describe_histogram!(
            "syncline_fetch_ms",
            Unit::Milliseconds,
            "Backend fetch latency in milliseconds."
        );
    });
}
