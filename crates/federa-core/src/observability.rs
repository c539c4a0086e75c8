//! Observability infrastructure for federa.
//!
//! Structured logging with consistent spans. This module provides the
//! initialization helper and span constructors used by every federa component.

use std::str::FromStr;
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

impl FromStr for LogFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        if s.eq_ignore_ascii_case("json") {
            Ok(Self::Json)
        } else if s.eq_ignore_ascii_case("pretty") {
            Ok(Self::Pretty)
        } else {
            Err(crate::Error::invalid_input(format!(
                "unknown log format '{s}' (expected 'json' or 'pretty')"
            )))
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops. Logs are written to stderr.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `federa_flow=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty().with_writer(std::io::stderr))
                    .init();
            }
        }
    });
}

/// Creates a span for a single sealer pass.
///
/// ```rust
/// use federa_core::observability::sealer_span;
///
/// let span = sealer_span(7);
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn sealer_span(pass: u64) -> Span {
    tracing::info_span!("sealer_pass", pass = pass)
}

/// Creates a span for an operation on a single query context.
#[must_use]
pub fn query_span(operation: &str, query_id: &str) -> Span {
    tracing::info_span!("query", op = operation, query_id = query_id)
}
