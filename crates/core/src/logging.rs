//! Structured logging setup shared by the shale binaries.
//!
//! Library code only emits `tracing` events; installing a subscriber is left
//! to the binary through [`init_logging`].

use std::io;

use crate::errors::{CoreError, CoreResult};
use tracing_subscriber::{fmt::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "warn")
    pub level: String,
    /// Enable JSON structured logging (vs plain text)
    pub json_format: bool,
    /// Enable pretty printing for development
    pub pretty_print: bool,
    /// Include file and line number information
    pub include_location: bool,
    /// Environment filter (supports filters like "shale_migrate=debug,sqlx=warn")
    pub env_filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            pretty_print: false,
            include_location: false,
            env_filter: None,
        }
    }
}

impl LoggingConfig {
    /// Create production logging configuration
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            json_format: true,
            pretty_print: false,
            include_location: false,
            env_filter: Some("shale=info,shale_migrate=info,sqlx=warn".to_string()),
        }
    }

    /// Create development logging configuration
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            json_format: false,
            pretty_print: true,
            include_location: true,
            env_filter: Some("shale=debug,shale_migrate=debug,sqlx=info".to_string()),
        }
    }

    /// Create test logging configuration (minimal output)
    pub fn test() -> Self {
        Self {
            level: "error".to_string(),
            json_format: false,
            pretty_print: false,
            include_location: false,
            env_filter: Some("shale_migrate=error".to_string()),
        }
    }

    /// Create a plain configuration for a level, keeping sqlx quiet
    pub fn for_level(level: &str) -> Self {
        Self {
            level: level.to_string(),
            env_filter: Some(format!("{level},sqlx=warn")),
            ..Self::default()
        }
    }

    /// Switch to JSON output
    pub fn json(mut self) -> Self {
        self.json_format = true;
        self.pretty_print = false;
        self
    }

    /// Set environment filter
    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }
}

/// Initialize structured logging for the process.
///
/// `RUST_LOG` takes precedence over the configured filter. Logs go to stderr
/// so that plan and status output on stdout stays machine-readable.
pub fn init_logging(config: &LoggingConfig) -> CoreResult<()> {
    let env_filter = config.env_filter.as_deref().unwrap_or(&config.level);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(env_filter))
        .map_err(|e| CoreError::logging(format!("invalid log filter '{}': {}", env_filter, e)))?;

    let layer = Layer::new()
        .with_writer(io::stderr)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    if config.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init()
            .map_err(|e| CoreError::logging(e.to_string()))?;
    } else if config.pretty_print {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.pretty())
            .try_init()
            .map_err(|e| CoreError::logging(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()
            .map_err(|e| CoreError::logging(e.to_string()))?;
    }

    tracing::debug!(
        level = %config.level,
        json = config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let production = LoggingConfig::production();
        assert!(production.json_format);
        assert!(!production.pretty_print);

        let development = LoggingConfig::development();
        assert!(development.pretty_print);
        assert_eq!(development.level, "debug");

        let test = LoggingConfig::test();
        assert_eq!(test.level, "error");
    }

    #[test]
    fn test_for_level_and_json() {
        let config = LoggingConfig::for_level("warn").json();
        assert_eq!(config.level, "warn");
        assert!(config.json_format);
        assert_eq!(config.env_filter.as_deref(), Some("warn,sqlx=warn"));
    }

    #[test]
    fn test_second_init_reports_logging_error() {
        let config = LoggingConfig::test();
        let _ = init_logging(&config);
        let err = init_logging(&config).unwrap_err();
        assert!(matches!(err, CoreError::Logging { .. }));
    }
}
