//! Log subscriber setup and metric descriptions.
//!
//! The host usually owns the global subscriber. Standalone deployments call
//! [`init_logging`] with the `logging` section of [`ServiceConfig`]:
//!
//! ```ignore
//! let config = ServiceConfig::load("rankguard.yaml")?;
//! init_logging(&config.logging.to_logging_config());
//! ```
//!
//! JSON lines carry the event fields under `fields` and the enclosing span
//! (for example the `upsert_group` span with its `group_id`) under `span`.
//!
//! [`ServiceConfig`]: crate::config::ServiceConfig

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Encoding of emitted log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Used when `RUST_LOG` is unset.
    pub level: Level,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::new(LogFormat::Text, Level::INFO)
    }
}

impl LoggingConfig {
    pub fn new(format: LogFormat, level: Level) -> Self {
        Self { format, level }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.to_string()))
    }
}

/// Installs the global subscriber.
///
/// Returns false, leaving the existing one in place, if a subscriber was
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let (json, text) = match config.format {
        LogFormat::Json => (
            Some(fmt::layer().json().with_current_span(true).with_target(true)),
            None,
        ),
        LogFormat::Text => (None, Some(fmt::layer().with_target(true))),
    };
    tracing_subscriber::registry()
        .with(config.filter())
        .with(json)
        .with(text)
        .try_init()
        .is_ok()
}

/// Describes every metric the service emits to the installed recorder.
///
/// Without a recorder this is a no-op. `PermissionService::start` calls it.
pub fn register_metrics() {
    rankguard_domain::cache::register_permission_cache_metrics();
    metrics::describe_counter!(
        "rankguard_default_fallbacks_total",
        "Checks answered with the default policy because no resolved set was available"
    );
    metrics::describe_counter!(
        "rankguard_invalidations_total",
        "Per-player cache invalidations issued after committed mutations"
    );
    metrics::describe_counter!(
        "rankguard_invalidations_collapsed_total",
        "Invalidations folded into an in-flight notification"
    );
    metrics::describe_counter!(
        "rankguard_storage_retries_total",
        "Storage calls retried after a transient failure"
    );
    metrics::describe_counter!(
        "rankguard_io_pool_saturated_total",
        "Storage calls that timed out waiting for an I/O pool permit"
    );
    metrics::describe_gauge!(
        "rankguard_degraded",
        "1 while storage retries are exhausted, 0 otherwise"
    );
    metrics::describe_histogram!(
        "rankguard_storage_query_duration_seconds",
        metrics::Unit::Seconds,
        "PostgreSQL query latency by operation"
    );
    metrics::describe_counter!(
        "rankguard_storage_query_timeout_total",
        "PostgreSQL queries that exceeded their timeout"
    );
}
