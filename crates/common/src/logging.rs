//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Log levels accepted by the configuration and the command line
pub const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` takes precedence over `default_level`.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| crate::Error::Logging(e.to_string()))?;

    Ok(())
}

/// Check that `level` names one of [`VALID_LOG_LEVELS`]
pub fn validate_log_level(level: &str) -> crate::Result<()> {
    if VALID_LOG_LEVELS.contains(&level) {
        Ok(())
    } else {
        Err(crate::Error::Config(format!(
            "Invalid log level '{}', must be one of: {}",
            level,
            VALID_LOG_LEVELS.join(", ")
        )))
    }
}
