use std::path::PathBuf;

use cadenza_core::PipelineConfig;
use url::Url;

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub metadata: ConfigMetadata,
}

impl Config {
    /// Creates the scratch, upload and artifact directories if they are missing.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.pipeline.media.work_dir)?;
        std::fs::create_dir_all(&self.pipeline.media.upload_dir)?;
        std::fs::create_dir_all(&self.storage.root)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
}

/// Filesystem-backed artifact store settings.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub public_base_url: Url,
}

/// Where the configuration came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
