//! Layered server configuration: `.env`, an optional TOML file, then
//! environment overrides.

pub mod loader;
pub mod models;
pub mod sources;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    Config, ConfigMetadata, DatabaseConfig, ServerConfig, StorageConfig,
};
pub use validation::{ConfigWarning, ConfigWarnings};
