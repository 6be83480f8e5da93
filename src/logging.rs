//! Tracing initialization.
//!
//! Structured, async-aware logging via `tracing` and `tracing-subscriber`:
//! environment-based filtering (`RUST_LOG` overrides the configured level)
//! and three output formats — pretty for development, compact for
//! production, JSON for log aggregation.

use crate::config::{LogFormat, Settings};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Initialize the global tracing subscriber from settings.
///
/// Idempotent: a second call (tests, embedding) is a no-op instead of an
/// error.
///
/// # Errors
/// Returns an error when the configured log filter fails to parse.
pub fn init_from_settings(settings: &Settings) -> Result<(), String> {
    init(&settings.log_level, settings.log_format)
}

/// Initialize with an explicit filter directive and format.
pub fn init(filter: &str, format: LogFormat) -> Result<(), String> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter)
            .map_err(|e| format!("invalid log filter '{filter}': {e}"))?,
    };

    let result = match format {
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .pretty()
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
        LogFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_ansi(false)
                .with_thread_names(true)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
        LogFormat::Json => {
            let layer = fmt::layer().json().with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
    };

    match result {
        Ok(()) => Ok(()),
        // A subscriber set earlier (tests, embedding) is fine.
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(format!("failed to initialize tracing: {e}")),
    }
}
