//! Tracing subscriber initialization.
//!
//! The log level defaults to `info` when logging is enabled and `error`
//! otherwise; `RUST_LOG` overrides both. The sink is stdout unless the
//! config names a log file, which is opened in append mode.

use crate::config::Config;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global subscriber. Safe to call more than once; later
/// calls are no-ops (the first subscriber wins).
pub fn init_logging(config: &Config) {
    let default_level = if config.enable_logging { "info" } else { "error" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if config.log_file.is_empty() {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
        return;
    }

    match OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_file)
    {
        Ok(file) => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .try_init();
        }
        Err(e) => {
            // Fall back to stdout rather than starting mute.
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init();
            tracing::warn!(path = %config.log_file, error = %e, "could not open log file, logging to stdout");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let config = Config::default();
        init_logging(&config);
        init_logging(&config);
    }
}
