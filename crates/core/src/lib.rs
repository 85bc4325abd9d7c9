//! # shale-core
//!
//! Configuration layering, logging setup and shared error types for the
//! shale schema migration runner.

pub mod config;
pub mod errors;
pub mod logging;

pub use config::{
    ConfigError, ConfigSource, MigrateConfig, TargetMatch, DEFAULT_CONFIG_FILE,
    DEFAULT_MIGRATIONS_DIR, DEFAULT_STATE_TABLE,
};
pub use errors::{CoreError, CoreResult};
pub use logging::{init_logging, LoggingConfig};
