//! Tracing/logging initialization.
//!
//! The filter comes from `RUST_LOG` and defaults to `info` for the stockbook
//! crates and `warn` for sqlx, whose per-statement logs drown out the
//! processor's own events.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,sqlx=warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable output for local runs.
    Pretty,
}

impl LogFormat {
    /// `json` unless `STOCKBOOK_LOG_FORMAT=pretty`.
    pub fn from_env() -> Self {
        match std::env::var("STOCKBOOK_LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = match format {
        LogFormat::Json => builder.json().with_target(false).with_current_span(true).try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}
