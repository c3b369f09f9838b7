//! Structured logging setup.
//!
//! `RUST_LOG` wins when set; otherwise the configured level applies to the
//! whole process.

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber built from `config`.
///
/// Returns an error if another subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string().to_lowercase()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| ProtocolError::ConfigError(format!("Failed to install logger: {e}")))?;

    info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}

/// Like [`init_logging`], but ignores an already installed subscriber.
///
/// Handy in tests, where every test may try to set up logging.
pub fn try_init_logging(config: &LoggingConfig) {
    let _ = init_logging(config);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_rejected() {
        try_init_logging(&LoggingConfig::default());
        assert!(init_logging(&LoggingConfig::default()).is_err());
    }
}
