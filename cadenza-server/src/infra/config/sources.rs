use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use cadenza_core::PipelineConfig;

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub database: FileDatabaseConfig,
    #[serde(default)]
    pub storage: FileStorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_base_url: Option<String>,
}

/// Environment overrides. Anything set here wins over the file.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub database_url: Option<String>,
    pub ffmpeg_path: Option<PathBuf>,
    pub voice_detector_program: Option<PathBuf>,
    pub artifact_root: Option<PathBuf>,
    pub artifact_public_url: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub upload_dir: Option<PathBuf>,
    pub worker_slots: Option<usize>,
    pub retain_source: Option<bool>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: std::env::var("CADENZA_CONFIG").ok().map(PathBuf::from),
            server_host: std::env::var("SERVER_HOST").ok(),
            server_port: std::env::var("SERVER_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            database_url: std::env::var("DATABASE_URL").ok(),
            ffmpeg_path: std::env::var("FFMPEG_PATH").ok().map(PathBuf::from),
            voice_detector_program: std::env::var("VOICE_DETECTOR_PROGRAM")
                .ok()
                .map(PathBuf::from),
            artifact_root: std::env::var("ARTIFACT_ROOT")
                .ok()
                .map(PathBuf::from),
            artifact_public_url: std::env::var("ARTIFACT_PUBLIC_URL").ok(),
            work_dir: std::env::var("WORK_DIR").ok().map(PathBuf::from),
            upload_dir: std::env::var("UPLOAD_DIR").ok().map(PathBuf::from),
            worker_slots: std::env::var("WORKER_SLOTS")
                .ok()
                .and_then(|s| s.parse().ok()),
            retain_source: parse_bool_var("RETAIN_SOURCE_UNTIL_TERMINAL"),
        }
    }
}

fn parse_bool_var(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|raw| {
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    })
}
