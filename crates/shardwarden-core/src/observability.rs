//! Logging initialization and span helpers.
//!
//! Every maintenance phase and action execution runs inside a span built
//! here so log lines carry the server, database and resource they concern.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops. A global
/// subscriber installed by someone else is left in place.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `shardwarden_maintenance=debug`)
///
/// # Example
///
/// ```rust
/// use shardwarden_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let installed = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init(),
        };
        if installed.is_err() {
            tracing::debug!("global tracing subscriber already installed");
        }
    });
}

/// Creates a span for one maintenance phase on one server.
///
/// # Example
///
/// ```rust
/// use shardwarden_core::observability::maintenance_span;
///
/// let span = maintenance_span("phase_one", "PRMR-1");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn maintenance_span(phase: &str, server_id: &str) -> Span {
    tracing::info_span!("maintenance", phase = phase, server = server_id)
}

/// Creates a span for executing a single maintenance action.
#[must_use]
pub fn action_span(kind: &str, database: &str, resource: &str, action_id: &str) -> Span {
    tracing::info_span!(
        "action",
        kind = kind,
        database = database,
        resource = resource,
        action_id = action_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn spans_can_be_entered() {
        let span = maintenance_span("phase_two", "PRMR-1");
        let _guard = span.enter();
        let inner = action_span("CreateShard", "_system", "s1", "01J0000000000000000000000");
        let _inner = inner.enter();
        tracing::info!("inside action");
    }
}
