//! Logging setup for the plugin binary.
//!
//! All logs are written to **stderr**. stdout carries the handshake line the
//! host parses, so nothing else may be printed there.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Controls log levels (e.g., `info`, `debug`, `hemmer_provider_puppetca=debug`)

use tracing_subscriber::{fmt, prelude::*, util::SubscriberInitExt, EnvFilter};

fn subscriber(default_level: &str) -> impl SubscriberInitExt {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false),
    )
}

/// Initialize the default logging subscriber.
///
/// Respects `RUST_LOG` and falls back to `info`.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging() {
    init_logging_with_default("info");
}

/// Initialize logging with a custom default level used when `RUST_LOG` is unset.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging_with_default(default_level: &str) {
    subscriber(default_level).init();
}

/// Try to initialize logging, returning false if already initialized.
pub fn try_init_logging() -> bool {
    subscriber("info").try_init().is_ok()
}

#[cfg(test)]
mod tests {
    // The global subscriber can only be set once per process, so only the
    // idempotent entry point is exercised here.

    use super::*;

    #[test]
    fn test_env_filter_parsing() {
        assert!(EnvFilter::try_new("info").is_ok());
        assert!(EnvFilter::try_new("hemmer_provider_puppetca=debug").is_ok());
        assert!(EnvFilter::try_new("warn,hemmer_provider_puppetca=trace").is_ok());
    }

    #[test]
    fn test_subscriber_honours_default_level() {
        // Building must not install anything globally.
        let _subscriber = subscriber("debug");
        let _subscriber = subscriber("warn");
    }

    #[test]
    fn test_try_init_is_idempotent() {
        let _ = try_init_logging();
        assert!(!try_init_logging());
    }
}
