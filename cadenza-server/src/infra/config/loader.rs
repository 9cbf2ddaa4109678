use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use url::Url;

use cadenza_core::PipelineError;

use super::{
    models::{
        Config, ConfigMetadata, DatabaseConfig, ServerConfig, StorageConfig,
    },
    sources::{EnvConfig, FileConfig},
    validation::{self, ConfigWarnings},
};

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] =
    ["cadenza.toml", "config/cadenza.toml"];

const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:3000/media/";

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

/// A resolved configuration and the warnings collected while resolving it.
#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to load env file: {0}")]
    Dotenv(#[from] dotenvy::Error),

    #[error("configuration file {path} does not exist")]
    MissingConfig { path: PathBuf },

    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid artifact public URL {value:?}: {source}")]
    PublicUrl {
        value: String,
        #[source]
        source: url::ParseError,
    },

    #[error(
        "upload directory {upload_dir} overlaps the artifact root {artifact_root}; \
         processed inputs are deleted from it"
    )]
    UploadDirOverlap {
        upload_dir: PathBuf,
        artifact_root: PathBuf,
    },

    #[error("invalid pipeline configuration: {0}")]
    Pipeline(#[from] PipelineError),
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        let env_config = EnvConfig::gather();
        let (file_config, config_path) = self.load_file_config(&env_config)?;

        let metadata = ConfigMetadata {
            config_path,
            env_file_loaded,
        };
        Self::from_sources(file_config, env_config, metadata)
    }

    fn load_file_config(
        &self,
        env_config: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let (path, explicit) = match (&self.options.config_path, &env_config.config_path) {
            (Some(path), _) | (None, Some(path)) => (Some(path.clone()), true),
            (None, None) => (
                DEFAULT_CONFIG_LOCATIONS
                    .iter()
                    .map(PathBuf::from)
                    .find(|candidate| candidate.exists()),
                false,
            ),
        };

        let Some(path) = path else {
            return Ok((None, None));
        };

        if !path.exists() {
            if explicit {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let file_config = read_file_config(&path)?;
        Ok((Some(file_config), Some(path)))
    }

    /// Layers environment overrides over the file (or the defaults when no
    /// file was found) and validates the result.
    pub fn from_sources(
        file_config: Option<FileConfig>,
        env: EnvConfig,
        metadata: ConfigMetadata,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let mut warnings = ConfigWarnings::default();

        if file_config.is_none() {
            warnings.push_with_hint(
                "No cadenza.toml detected; falling back to environment variables",
                "Pass --config or set CADENZA_CONFIG to use a configuration file",
            );
        }

        let FileConfig {
            server: file_server,
            database: file_database,
            storage: file_storage,
            pipeline: mut pipeline,
        } = file_config.unwrap_or_default();

        let server = ServerConfig {
            host: env
                .server_host
                .or(file_server.host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env.server_port.or(file_server.port).unwrap_or(3000),
        };

        let database = DatabaseConfig {
            url: env
                .database_url
                .filter(|value| !value.trim().is_empty())
                .or(file_database.url),
            max_connections: file_database
                .max_connections
                .unwrap_or(DatabaseConfig::DEFAULT_MAX_CONNECTIONS),
        };

        let raw_public_url = env
            .artifact_public_url
            .or(file_storage.public_base_url)
            .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.to_string());
        let public_base_url = Url::parse(&raw_public_url).map_err(|source| {
            ConfigLoadError::PublicUrl {
                value: raw_public_url.clone(),
                source,
            }
        })?;
        let storage = StorageConfig {
            root: env
                .artifact_root
                .or(file_storage.root)
                .unwrap_or_else(|| PathBuf::from("./artifacts")),
            public_base_url,
        };

        if let Some(ffmpeg) = env.ffmpeg_path {
            pipeline.transcoder.ffmpeg_path = ffmpeg;
        }
        if let Some(program) = env.voice_detector_program {
            pipeline.voice_detector.program = program;
        }
        if let Some(work_dir) = env.work_dir {
            pipeline.media.work_dir = work_dir;
        }
        if let Some(upload_dir) = env.upload_dir {
            pipeline.media.upload_dir = upload_dir;
        }
        if let Some(slots) = env.worker_slots {
            pipeline.queue.worker_slots = slots;
        }
        if let Some(retain) = env.retain_source {
            pipeline.media.retain_source_until_terminal = retain;
        }

        pipeline.validate()?;

        let upload_dir = &pipeline.media.upload_dir;
        if upload_dir.starts_with(&storage.root) || storage.root.starts_with(upload_dir) {
            return Err(ConfigLoadError::UploadDirOverlap {
                upload_dir: upload_dir.clone(),
                artifact_root: storage.root.clone(),
            });
        }

        let config = Config {
            server,
            database,
            storage,
            pipeline,
            metadata,
        };

        warnings.extend(validation::collect_warnings(&config));

        Ok(ConfigLoad { config, warnings })
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents =
        fs::read_to_string(path).map_err(|err| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source: err,
        })?;
    toml::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source: err,
    })
}
