//! Tracing subscriber setup for the CLI.
//!
//! Filter precedence: `--verbose`, then `CRONLEASE_LOG`, then `RUST_LOG`,
//! then `logging.level` from cronlease.toml. Logs go to stderr so command
//! output on stdout stays machine-readable.

use std::sync::Once;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{CronleaseConfig, LogFormat};

static INIT: Once = Once::new();

/// Install the global subscriber. Later calls are no-ops.
pub fn init(config: &CronleaseConfig) {
    let filter = build_filter(
        config.log_override().as_deref(),
        &config.toml.logging.level,
    );
    let format = config.toml.logging.format;
    INIT.call_once(|| match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
                .init();
        }
    });
}

/// Resolve the filter from an explicit directive, `RUST_LOG`, or `fallback`.
/// An unparsable directive falls through to the next source.
pub fn build_filter(explicit: Option<&str>, fallback: &str) -> EnvFilter {
    if let Some(directive) = explicit
        && let Ok(filter) = EnvFilter::try_new(directive)
    {
        return filter;
    }
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
