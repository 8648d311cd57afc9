//! Structured logging initialization.
//!
//! Configures the tracing subscriber for structured logging output.
//! The RUST_LOG environment variable takes precedence over the default
//! level passed by the caller.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize the logging subsystem.
///
/// If RUST_LOG is set it is used as the filter; otherwise `default_level`
/// (e.g. `"info"`) is applied. Safe to call more than once; later calls
/// are no-ops.
///
/// # Example
///
/// ```ignore
/// muxio::logging::init("info");
///
/// tracing::info!("server starting");
/// ```
pub fn init(default_level: &str) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_level)
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_names(true))
        .try_init();
}
