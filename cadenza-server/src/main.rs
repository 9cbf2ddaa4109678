//! # Cadenza Server
//!
//! Entry point for both process roles. `--role api` serves the enqueue/poll
//! HTTP surface; `--role worker` runs the pipeline worker runtime until
//! SIGINT/SIGTERM, letting in-flight jobs finish first.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use cadenza_core::MIGRATOR;
use cadenza_server::api::create_router;
use cadenza_server::infra::{
    config::{Config, ConfigLoad, ConfigLoader, ConfigLoaderOptions},
    startup,
};

#[derive(Debug, Parser)]
#[command(
    name = "cadenza-server",
    version,
    about = "Cadenza track-processing service"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Debug, Clone, Args)]
struct ServeArgs {
    /// Which half of the service this process runs
    #[arg(long, value_enum, env = "CADENZA_ROLE", default_value_t = Role::Api)]
    role: Role,

    /// Path to a cadenza.toml configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Alternate .env file to load before reading the environment
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Override the HTTP port (api role)
    #[arg(long)]
    port: Option<u16>,

    /// Override the HTTP bind host (api role)
    #[arg(long)]
    host: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Api,
    Worker,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Database maintenance
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Check connectivity and report pending migrations
    Preflight,
    /// Apply the embedded schema migrations
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli.serve)?;

    match cli.command {
        Some(Command::Db(command)) => run_db_command(command, &config).await,
        None => match cli.serve.role {
            Role::Api => run_api(config).await,
            Role::Worker => run_worker(config).await,
        },
    }
}

fn load_runtime_config(args: &ServeArgs) -> anyhow::Result<Config> {
    let ConfigLoad {
        mut config,
        warnings,
    } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: args.config.clone(),
        env_file: args.env_file.clone(),
    })
    .load()
    .context("failed to load configuration")?;

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host.clone() {
        config.server.host = host;
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "info,cadenza_core=info,tower_http=warn".into()
        }))
        .with(fmt::layer())
        .init();

    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    let queue_cfg = &config.pipeline.queue;
    info!(
        worker_slots = queue_cfg.worker_slots,
        lease_ttl_secs = queue_cfg.lease.lease_ttl_secs,
        max_attempts = queue_cfg.retry.max_attempts,
        max_duration_secs = config.pipeline.media.max_duration_secs,
        "pipeline configuration"
    );

    Ok(config)
}

async fn run_db_command(command: DbCommand, config: &Config) -> anyhow::Result<()> {
    let pool = startup::connect_pool(&config.database).await?;
    match command {
        DbCommand::Migrate => {
            MIGRATOR
                .run(&pool)
                .await
                .context("database migration failed")?;
            info!("database migrations applied");
        }
        DbCommand::Preflight => {
            let version: String = sqlx::query_scalar("SELECT version()")
                .fetch_one(&pool)
                .await
                .context("database is not reachable")?;
            let applied: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM _sqlx_migrations WHERE success",
            )
            .fetch_one(&pool)
            .await
            .unwrap_or(0);
            let known = MIGRATOR.iter().count() as i64;
            info!(server = %version, applied, known, "database preflight");
            if applied < known {
                anyhow::bail!(
                    "{} migration(s) pending; run `cadenza-server db migrate`",
                    known - applied
                );
            }
        }
    }
    pool.close().await;
    Ok(())
}

async fn run_api(config: Config) -> anyhow::Result<()> {
    config
        .ensure_directories()
        .context("failed to prepare storage directories")?;
    let pool = startup::connect_pool(&config.database).await?;
    let state = startup::api_state(&config, pool).await?;
    let router = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid bind address {}:{}",
                config.server.host, config.server.port
            )
        })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("Starting Cadenza API on {addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("API server stopped");
    Ok(())
}

async fn run_worker(config: Config) -> anyhow::Result<()> {
    config
        .ensure_directories()
        .context("failed to prepare working directories")?;
    let pool = startup::connect_pool(&config.database).await?;
    let runtime = startup::worker_runtime(&config, pool.clone()).await?;

    runtime.start().await;
    shutdown_signal().await;
    info!("shutdown requested; draining in-flight jobs");
    runtime.shutdown().await;
    pool.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for SIGINT: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
