use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};
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

/// Register descriptions for every metric the cache emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "tiercache_hit_total",
            Unit::Count,
            "Total number of requests answered from the cache."
        );
        describe_counter!(
            "tiercache_miss_total",
            Unit::Count,
            "Total number of cacheable requests that ran their handler."
        );
        describe_counter!(
            "tiercache_bypass_total",
            Unit::Count,
            "Total number of lookups skipped because the client sent no-cache."
        );
        describe_counter!(
            "tiercache_store_total",
            Unit::Count,
            "Total number of responses stored."
        );
        describe_counter!(
            "tiercache_store_failed_total",
            Unit::Count,
            "Total number of responses that could not be written to disk."
        );
        describe_counter!(
            "tiercache_evict_total",
            Unit::Count,
            "Total number of entries removed, labelled by reason."
        );
        describe_gauge!(
            "tiercache_captures_in_flight",
            Unit::Count,
            "Current number of cache misses whose responses are being captured."
        );
    });
}
