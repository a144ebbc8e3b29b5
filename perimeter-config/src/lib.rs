//! Runtime configuration for Perimeter.
//!
//! Loads the shared-state connection settings and the pipeline tuning from
//! the environment, an optional `.env` file and TOML/JSON files, checks them
//! against guard rails, and sets up `tracing` for binaries.

pub mod loader;
pub mod models;
pub mod telemetry;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoader, error::ConfigLoadError};
pub use models::{
    Config, ConfigMetadata, ConfigSource, FileConfig, FileRedisConfig,
    RedisConfig,
};
pub use perimeter_core::config::PipelineConfig;
pub use telemetry::{DEFAULT_DIRECTIVES, init_tracing};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
