use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use cadenza_core::pipeline::resolve_staged_input;
use cadenza_core::queue::{EnqueueRequest, JobOptions, JobStatus};
use cadenza_core::types::{JobId, TrackId, TrackSubmission};

use crate::errors::{AppError, AppResult};
use crate::infra::app_state::AppState;

use super::routes;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(routes::TRACK_JOBS, post(submit_job))
        .route(routes::TRACK_JOB, get(job_status))
        .route(routes::TRACK, delete(delete_track))
}

/// Body of `POST /api/tracks/jobs`: the staged upload plus optional queue
/// options.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    #[serde(flatten)]
    pub submission: TrackSubmission,
    #[serde(default)]
    pub options: JobOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    pub status: String,
}

async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitJobRequest>,
) -> AppResult<(StatusCode, Json<SubmitJobResponse>)> {
    let SubmitJobRequest {
        submission,
        options,
    } = request;
    validate_submission(&state, &submission).await?;

    let queue_config = &state.pipeline.queue;
    let enqueue =
        EnqueueRequest::new(submission, &queue_config.retry, queue_config.retention)
            .with_options(options);
    let artist_id = enqueue.payload.artist_id;
    let handle = state.queue.enqueue(enqueue).await?;

    info!(job_id = %handle.id, artist_id = %artist_id, "track job admitted");
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse {
            job_id: handle.id,
            status: "processing".to_string(),
        }),
    ))
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<JobStatus>> {
    state
        .queue
        .status(JobId(id))
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("job {id} not found")))
}

async fn delete_track(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    if state.catalog.delete_track(TrackId(id)).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("track {id} not found")))
    }
}

/// Rejects malformed submissions before they reach the queue. Inputs must
/// already be staged inside the upload directory.
async fn validate_submission(state: &AppState, submission: &TrackSubmission) -> AppResult<()> {
    if submission.title.trim().is_empty() {
        return Err(AppError::bad_request("title must not be empty"));
    }
    if !submission.source_audio_path.is_absolute() {
        return Err(AppError::bad_request(
            "sourceAudioPath must be an absolute path",
        ));
    }
    if let Some(cover) = &submission.cover_image_path
        && !cover.is_absolute()
    {
        return Err(AppError::bad_request(
            "coverImagePath must be an absolute path",
        ));
    }
    if submission
        .duration_seconds
        .is_some_and(|secs| !secs.is_finite() || secs < 0.0)
    {
        return Err(AppError::bad_request(
            "durationSeconds must be a non-negative number",
        ));
    }

    let upload_dir = &state.pipeline.media.upload_dir;
    resolve_staged_input(upload_dir, &submission.source_audio_path, "sourceAudioPath").await?;
    if let Some(cover) = &submission.cover_image_path {
        resolve_staged_input(upload_dir, cover, "coverImagePath").await?;
    }
    Ok(())
}
