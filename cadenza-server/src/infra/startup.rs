//! Wiring of the Postgres-backed services for each process role.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use cadenza_core::pipeline::{PipelineDispatcher, PipelineOrchestrator, WorkerRuntime};
use cadenza_core::process::{CommandVoiceDetector, FfmpegTranscoder};
use cadenza_core::queue::PostgresQueueService;
use cadenza_core::storage::{ArtifactStore, FilesystemArtifactStore};
use cadenza_core::tracks::{PostgresTrackRepository, TrackCatalog};

use super::app_state::AppState;
use super::config::{Config, DatabaseConfig, StorageConfig};

pub async fn connect_pool(database: &DatabaseConfig) -> anyhow::Result<PgPool> {
    let url = database
        .url
        .as_deref()
        .context("DATABASE_URL (or database.url) is required")?;
    let pool = PgPoolOptions::new()
        .max_connections(database.max_connections)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    info!(max_connections = database.max_connections, "database pool ready");
    Ok(pool)
}

pub fn artifact_store(storage: &StorageConfig) -> Arc<dyn ArtifactStore> {
    Arc::new(FilesystemArtifactStore::new(
        storage.root.clone(),
        storage.public_base_url.clone(),
    ))
}

pub async fn api_state(config: &Config, pool: PgPool) -> anyhow::Result<AppState> {
    let queue = PostgresQueueService::new(pool.clone(), config.pipeline.queue.retry)
        .await
        .context("queue schema is not ready; run `cadenza-server db migrate`")?;
    let catalog = TrackCatalog::new(
        Arc::new(PostgresTrackRepository::new(pool)),
        artifact_store(&config.storage),
    );
    Ok(AppState::new(
        Arc::new(queue),
        catalog,
        Arc::new(config.pipeline.clone()),
    ))
}

pub async fn worker_runtime(
    config: &Config,
    pool: PgPool,
) -> anyhow::Result<WorkerRuntime<PostgresQueueService>> {
    let pipeline = Arc::new(config.pipeline.clone());
    let queue = Arc::new(
        PostgresQueueService::new(pool.clone(), pipeline.queue.retry)
            .await
            .context("queue schema is not ready; run `cadenza-server db migrate`")?,
    );

    let orchestrator = PipelineOrchestrator::new(
        Arc::clone(&pipeline),
        Arc::new(FfmpegTranscoder::new(pipeline.transcoder.clone())),
        Arc::new(CommandVoiceDetector::new(pipeline.voice_detector.clone())),
        artifact_store(&config.storage),
        Arc::new(PostgresTrackRepository::new(pool)),
    )
    .context("failed to build the pipeline orchestrator")?;

    let dispatcher =
        PipelineDispatcher::new(Arc::new(orchestrator), queue.clone());

    Ok(WorkerRuntime::new(
        pipeline.queue.clone(),
        queue,
        Arc::new(dispatcher),
    ))
}
