//! `tracing` subscriber initialization.
//!
//! Grounded on the teacher's `logging::LoggingManager`: one global
//! subscriber built from an `EnvFilter` plus a `tracing_subscriber::fmt`
//! layer, initialized once at process start. Trimmed to what this crate
//! actually configures (level, JSON vs. compact); the teacher's rotation
//! and multi-destination plumbing has no counterpart here since nothing in
//! spec.md calls for file-based log rotation.

use tracing_subscriber::{fmt::time::UtcTime, EnvFilter};

use crate::config::LoggingConfig;

/// Initializes the global `tracing` subscriber from `config`. Safe to call
/// more than once per process (e.g. from multiple tests); later calls are
/// no-ops once a subscriber is already installed.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_timer(UtcTime::rfc_3339());

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    if result.is_err() {
        tracing::trace!("tracing subscriber already initialized");
    }
}
