//! Observability infrastructure for DataPack services.
//!
//! Structured logging with consistent spans: initialization helpers and span
//! constructors used by the orchestration engine and workers.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at process startup. Safe to call multiple times; subsequent
/// calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `datapack_flow=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for export orchestration operations with standard fields.
///
/// # Example
///
/// ```rust
/// use datapack_core::observability::export_span;
///
/// let span = export_span("dispatch_step", "01ARZ3NDEKTSV4RRFFQ69G5FAV");
/// let _guard = span.enter();
/// // ... do orchestration operation
/// ```
#[must_use]
pub fn export_span(operation: &str, run_id: &str) -> Span {
    tracing::info_span!("export", op = operation, run_id = run_id)
}

/// Creates a span for worker step executions.
#[must_use]
pub fn worker_span(step_kind: &str, step_id: &str, worker: &str) -> Span {
    tracing::info_span!("worker", kind = step_kind, step_id = step_id, host = worker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = export_span("create_run", "run_123");
        let _guard = span.enter();
        tracing::info!("test message in span");

        let span = worker_span("convert_gpkg", "step_123", "worker-1");
        let _guard = span.enter();
        tracing::info!("worker message");
    }
}
