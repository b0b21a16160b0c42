use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
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
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register units and help text for the cache metrics with the installed recorder.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "diskcache_hit_total",
            Unit::Count,
            "Requests answered from a fresh cache entry."
        );
        describe_counter!(
            "diskcache_stale_hit_total",
            Unit::Count,
            "Requests answered from an expired entry while it is refreshed."
        );
        describe_counter!(
            "diskcache_miss_total",
            Unit::Count,
            "Requests that found no usable entry."
        );
        describe_counter!(
            "diskcache_populate_total",
            Unit::Count,
            "Handler runs performed by the populating writer of a key."
        );
        describe_counter!(
            "diskcache_populate_failed_total",
            Unit::Count,
            "Populates that ended with a handler error, panic or cancellation."
        );
        describe_counter!(
            "diskcache_collision_total",
            Unit::Count,
            "Reads whose stored fingerprint did not match the request."
        );
        describe_counter!(
            "diskcache_fallback_total",
            Unit::Count,
            "Requests served by running the handler without the cache."
        );
        describe_counter!(
            "diskcache_exhausted_total",
            Unit::Count,
            "Requests that gave up after waiting on a populate twice."
        );
        describe_counter!(
            "diskcache_store_error_total",
            Unit::Count,
            "Entry writes that failed and left the response uncached."
        );
        describe_gauge!(
            "diskcache_lock_records",
            Unit::Count,
            "Per-key lock records currently held by the registry."
        );
        describe_histogram!(
            "diskcache_populate_ms",
            Unit::Milliseconds,
            "Populate latency in milliseconds."
        );
    });
}
