//! Logging configuration
//!
//! Initializes tracing for the application.

use crate::pipeline::LogColor;

/// Initializes logging with the specified level.
///
/// `RUST_LOG` takes precedence over `level`. Calling this more than once is
/// harmless; only the first call installs a subscriber.
pub fn init_logging(level: &str, color: LogColor, timestamps: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(color.enabled())
        .with_writer(std::io::stderr);

    let installed = if timestamps {
        builder.try_init()
    } else {
        builder.without_time().try_init()
    };

    if installed.is_err() {
        tracing::debug!("Logging already initialized");
    }
}
