use std::sync::Once;

use metrics::{Unit, describe_counter};
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

/// Register descriptions for every counter the gateway emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "pagegate_hit_total",
            Unit::Count,
            "Requests answered from the page cache."
        );
        describe_counter!(
            "pagegate_miss_total",
            Unit::Count,
            "Cacheable requests that fell through to the application."
        );
        describe_counter!(
            "pagegate_bypass_total",
            Unit::Count,
            "Requests that skipped the cache, labelled by reason."
        );
        describe_counter!(
            "pagegate_store_total",
            Unit::Count,
            "Generated pages written to the backend."
        );
        describe_counter!(
            "pagegate_capture_skipped_total",
            Unit::Count,
            "Generated pages not stored, labelled by reason."
        );
        describe_counter!(
            "pagegate_backend_error_total",
            Unit::Count,
            "Backend calls that failed and degraded to a miss, labelled by operation."
        );
        describe_counter!(
            "pagegate_flush_total",
            Unit::Count,
            "Full backend flushes."
        );
        describe_counter!(
            "pagegate_invalidated_keys_total",
            Unit::Count,
            "Cache keys deleted by targeted invalidation."
        );
    });
}
