//! Observability infrastructure for fanout.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors shared by every
//! fanout component.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

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
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `fanout_array=debug`)
///
/// # Example
///
/// ```rust
/// use fanout_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
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

/// Creates a span for one background assembly job.
///
/// # Example
///
/// ```rust
/// use fanout_core::observability::assembly_span;
///
/// let span = assembly_span("outputs", "exec-abc123");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn assembly_span(queue: &str, work_item: &str) -> Span {
    tracing::info_span!("assembly", queue = queue, work_item = work_item)
}
