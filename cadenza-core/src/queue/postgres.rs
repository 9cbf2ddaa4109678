//! Postgres-backed durable queue.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::error::{PipelineError, Result};
use crate::types::{JobId, TrackArtifactSet};

use super::{
    BackoffPolicy, DequeueRequest, EnqueueRequest, ExpiredLeaseScan,
    FailureDisposition, JobHandle, JobLease, JobRecord, JobState, JobStatus,
    LeaseExpiryScanner, LeaseId, LeaseRenewal, QueueService, RetentionPolicy,
    STALLED_ERROR,
};

const JOB_COLUMNS: &str = "id, payload, state, attempts_made, max_attempts, \
     backoff, keep_completed, keep_failed, progress, available_at, \
     lease_owner, lease_expires_at, result, last_error, created_at, \
     updated_at, finished_at";

/// Durable [`QueueService`] over the `pipeline_jobs` table.
#[derive(Clone)]
pub struct PostgresQueueService {
    pool: PgPool,
    retry: RetryConfig,
}

impl fmt::Debug for PostgresQueueService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresQueueService")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .field("retry", &self.retry)
            .finish()
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    payload: serde_json::Value,
    state: String,
    attempts_made: i32,
    max_attempts: i32,
    backoff: serde_json::Value,
    keep_completed: i32,
    keep_failed: i32,
    progress: i16,
    available_at: DateTime<Utc>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = PipelineError;

    fn try_from(row: JobRow) -> Result<Self> {
        let payload = serde_json::from_value(row.payload).map_err(|e| {
            PipelineError::Internal(format!("failed to deserialize job payload: {e}"))
        })?;
        let backoff: BackoffPolicy =
            serde_json::from_value(row.backoff).map_err(|e| {
                PipelineError::Internal(format!("failed to deserialize backoff: {e}"))
            })?;
        let result = row
            .result
            .map(serde_json::from_value::<TrackArtifactSet>)
            .transpose()
            .map_err(|e| {
                PipelineError::Internal(format!("failed to deserialize job result: {e}"))
            })?;
        let state = row.state.parse::<JobState>().map_err(PipelineError::Internal)?;

        Ok(JobRecord {
            id: JobId(row.id),
            payload,
            state,
            attempts_made: clamp_u16(row.attempts_made),
            max_attempts: clamp_u16(row.max_attempts),
            backoff,
            retention: RetentionPolicy {
                keep_completed: row.keep_completed.max(0) as u32,
                keep_failed: row.keep_failed.max(0) as u32,
            },
            progress: row.progress.clamp(0, 100) as u8,
            available_at: row.available_at,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            result,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
        })
    }
}

fn clamp_u16(value: i32) -> u16 {
    value.clamp(0, i32::from(u16::MAX)) as u16
}

fn millis(delay_ms: u64) -> i64 {
    i64::try_from(delay_ms).unwrap_or(i64::MAX)
}

impl PostgresQueueService {
    /// Create the service and verify DB health + schema.
    pub async fn new(pool: PgPool, retry: RetryConfig) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                PipelineError::Internal(format!(
                    "Queue service failed Postgres health check: {e}"
                ))
            })?;
        info!("Queue service connected to Postgres");

        let idx_exists = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT 1
            FROM pg_indexes
            WHERE indexname = $1
            LIMIT 1
            "#,
        )
        .bind("idx_pipeline_jobs_ready_dequeue")
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            PipelineError::Internal(format!(
                "Queue service schema validation failed: {e}"
            ))
        })?
        .is_some();

        if !idx_exists {
            return Err(PipelineError::Internal(
                "Required index idx_pipeline_jobs_ready_dequeue is missing; run migrations"
                    .into(),
            ));
        }

        Ok(Self { pool, retry })
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM pipeline_jobs WHERE id = $1"
        ))
        .bind(job_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PipelineError::Internal(format!("job lookup failed: {e}")))?;
        row.map(JobRecord::try_from).transpose()
    }

    /// Keeps only the newest `keep` finished jobs in `state`.
    async fn prune(
        tx: &mut Transaction<'_, Postgres>,
        state: JobState,
        keep: u32,
    ) -> Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM pipeline_jobs
            WHERE id IN (
                SELECT id FROM pipeline_jobs
                WHERE state = $1
                ORDER BY finished_at DESC NULLS LAST, id DESC
                OFFSET $2
            )
            "#,
        )
        .bind(state.as_str())
        .bind(i64::from(keep))
        .execute(&mut **tx)
        .await
        .map_err(|e| PipelineError::Internal(format!("retention prune failed: {e}")))?;
        if res.rows_affected() > 0 {
            debug!(state = %state, removed = res.rows_affected(), "pruned finished jobs");
        }
        Ok(res.rows_affected())
    }

    /// Shared failure transition for `fail` and stalled leases. The row must
    /// already be locked by `tx`.
    async fn record_failure(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: &JobRecord,
        retryable: bool,
        error: &str,
    ) -> Result<FailureDisposition> {
        let attempts_made = job.attempts_made.saturating_add(1);

        if !retryable || attempts_made >= job.max_attempts {
            sqlx::query(
                r#"
                UPDATE pipeline_jobs
                SET state = 'failed',
                    attempts_made = $2,
                    last_error = $3,
                    lease_id = NULL,
                    lease_owner = NULL,
                    lease_expires_at = NULL,
                    finished_at = NOW(),
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(job.id.0)
            .bind(i32::from(attempts_made))
            .bind(error)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                PipelineError::Internal(format!("fail update->failed failed: {e}"))
            })?;
            Self::prune(tx, JobState::Failed, job.retention.keep_failed).await?;
            return Ok(FailureDisposition::Failed { attempts_made });
        }

        let delay = job.backoff.delay_ms(attempts_made, self.retry.backoff_max_ms);
        let retry_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            UPDATE pipeline_jobs
            SET state = 'waiting',
                attempts_made = $2,
                last_error = $3,
                progress = 0,
                available_at = NOW() + ($4::bigint) * INTERVAL '1 millisecond',
                lease_id = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            RETURNING available_at
            "#,
        )
        .bind(job.id.0)
        .bind(i32::from(attempts_made))
        .bind(error)
        .bind(millis(delay))
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| {
            PipelineError::Internal(format!("fail update->waiting failed: {e}"))
        })?;

        Ok(FailureDisposition::RetryScheduled {
            attempts_made,
            retry_at,
        })
    }
}

#[async_trait]
impl QueueService for PostgresQueueService {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle> {
        let id = JobId::new();
        let payload = serde_json::to_value(&request.payload)?;
        let backoff = serde_json::to_value(request.backoff)?;

        let created_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            INSERT INTO pipeline_jobs
                (id, payload, state, max_attempts, backoff, keep_completed, keep_failed)
            VALUES ($1, $2, 'waiting', $3, $4, $5, $6)
            RETURNING created_at
            "#,
        )
        .bind(id.0)
        .bind(payload)
        .bind(i32::from(request.max_attempts.max(1)))
        .bind(backoff)
        .bind(request.retention.keep_completed as i32)
        .bind(request.retention.keep_failed as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PipelineError::Internal(format!("enqueue insert failed: {e}")))?;

        debug!(job_id = %id, "job enqueued");
        Ok(JobHandle {
            id,
            state: JobState::Waiting,
            created_at,
        })
    }

    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<JobLease>> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            PipelineError::Internal(format!("begin dequeue tx failed: {e}"))
        })?;

        let next: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM pipeline_jobs
            WHERE state = 'waiting'
              AND available_at <= NOW()
            ORDER BY available_at ASC, created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| PipelineError::Internal(format!("dequeue select failed: {e}")))?;

        let Some(job_id) = next else {
            // Nothing ready
            drop(tx);
            return Ok(None);
        };

        let lease_id = LeaseId::new();
        let ttl_ms = request.lease_ttl.num_milliseconds();
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE pipeline_jobs
            SET state = 'active',
                lease_id = $2,
                lease_owner = $3,
                lease_expires_at = NOW() + ($4::bigint) * INTERVAL '1 millisecond',
                progress = 0,
                updated_at = NOW()
            WHERE id = $1 AND state = 'waiting'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(lease_id.0)
        .bind(&request.worker_id)
        .bind(ttl_ms)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            PipelineError::Internal(format!("dequeue update->active failed: {e}"))
        })?;

        let Some(row) = row else {
            // Raced with a state change; treat as empty
            drop(tx);
            return Ok(None);
        };

        let job = JobRecord::try_from(row)?;
        tx.commit().await.map_err(|e| {
            PipelineError::Internal(format!("dequeue tx commit failed: {e}"))
        })?;

        let expires_at = job
            .lease_expires_at
            .unwrap_or_else(|| Utc::now() + request.lease_ttl);
        Ok(Some(JobLease {
            lease_id,
            job,
            lease_owner: request.worker_id,
            expires_at,
            renewals: 0,
        }))
    }

    async fn renew(&self, renewal: LeaseRenewal) -> Result<JobLease> {
        let extend_ms = renewal.extend_by.num_milliseconds();
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE pipeline_jobs
            SET lease_expires_at = GREATEST(
                    lease_expires_at,
                    NOW() + ($2::bigint) * INTERVAL '1 millisecond'
                ),
                updated_at = NOW()
            WHERE lease_id = $1
              AND state = 'active'
              AND lease_expires_at > NOW()
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(renewal.lease_id.0)
        .bind(extend_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PipelineError::Internal(format!("renew update failed: {e}")))?;

        let Some(row) = row else {
            warn!(lease = %renewal.lease_id, "renewal failed: lease not found or expired");
            return Err(PipelineError::NotFound("lease not found or expired".into()));
        };

        let job = JobRecord::try_from(row)?;
        let expires_at = job.lease_expires_at.ok_or_else(|| {
            PipelineError::Invariant("active job without lease expiry".into())
        })?;
        Ok(JobLease {
            lease_id: renewal.lease_id,
            lease_owner: job.lease_owner.clone().unwrap_or(renewal.worker_id),
            job,
            expires_at,
            // Renewal counts are tracked by the worker holding the lease.
            renewals: 0,
        })
    }

    async fn report_progress(&self, lease_id: LeaseId, progress: u8) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET progress = GREATEST(progress, $2),
                updated_at = NOW()
            WHERE lease_id = $1 AND state = 'active'
            "#,
        )
        .bind(lease_id.0)
        .bind(i16::from(progress.min(100)))
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Internal(format!("progress update failed: {e}")))?;

        if res.rows_affected() == 0 {
            return Err(PipelineError::NotFound(format!("lease {lease_id} not held")));
        }
        Ok(())
    }

    async fn complete(
        &self,
        lease_id: LeaseId,
        result: TrackArtifactSet,
    ) -> Result<()> {
        let result = serde_json::to_value(&result)?;
        let mut tx = self.pool.begin().await.map_err(|e| {
            PipelineError::Internal(format!("begin complete tx failed: {e}"))
        })?;

        let keep: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE pipeline_jobs
            SET state = 'completed',
                progress = 100,
                result = $2,
                last_error = NULL,
                lease_id = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE lease_id = $1 AND state = 'active'
            RETURNING keep_completed
            "#,
        )
        .bind(lease_id.0)
        .bind(result)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| PipelineError::Internal(format!("complete update failed: {e}")))?;

        let Some(keep) = keep else {
            return Err(PipelineError::NotFound(format!("lease {lease_id} not held")));
        };
        Self::prune(&mut tx, JobState::Completed, keep.max(0) as u32).await?;

        tx.commit().await.map_err(|e| {
            PipelineError::Internal(format!("complete tx commit failed: {e}"))
        })?;
        debug!(lease = %lease_id, "completed job");
        Ok(())
    }

    async fn fail(
        &self,
        lease_id: LeaseId,
        retryable: bool,
        error: String,
    ) -> Result<FailureDisposition> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            PipelineError::Internal(format!("begin fail tx failed: {e}"))
        })?;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM pipeline_jobs
            WHERE lease_id = $1 AND state = 'active'
            FOR UPDATE
            "#
        ))
        .bind(lease_id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| PipelineError::Internal(format!("fail select failed: {e}")))?;

        let Some(row) = row else {
            return Err(PipelineError::NotFound(format!("lease {lease_id} not held")));
        };
        let job = JobRecord::try_from(row)?;
        let disposition = self.record_failure(&mut tx, &job, retryable, &error).await?;

        tx.commit().await.map_err(|e| {
            PipelineError::Internal(format!("fail tx commit failed: {e}"))
        })?;
        Ok(disposition)
    }

    async fn status(&self, job_id: JobId) -> Result<Option<JobStatus>> {
        Ok(self.get(job_id).await?.map(|job| job.status()))
    }
}

#[async_trait]
impl LeaseExpiryScanner for PostgresQueueService {
    async fn scan_expired_leases(&self) -> Result<ExpiredLeaseScan> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            PipelineError::Internal(format!("begin lease scan tx failed: {e}"))
        })?;

        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM pipeline_jobs
            WHERE state = 'active'
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at < NOW()
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| PipelineError::Internal(format!("lease scan select failed: {e}")))?;

        let mut scan = ExpiredLeaseScan::default();
        for row in rows {
            let job = JobRecord::try_from(row)?;
            match self.record_failure(&mut tx, &job, true, STALLED_ERROR).await? {
                FailureDisposition::RetryScheduled { .. } => {
                    info!(job_id = %job.id, "stalled job requeued");
                    scan.requeued += 1;
                }
                FailureDisposition::Failed { attempts_made } => {
                    warn!(job_id = %job.id, "stalled job exhausted its attempts");
                    let mut exhausted = job;
                    exhausted.state = JobState::Failed;
                    exhausted.attempts_made = attempts_made;
                    exhausted.last_error = Some(STALLED_ERROR.to_string());
                    exhausted.lease_owner = None;
                    exhausted.lease_expires_at = None;
                    exhausted.finished_at = Some(Utc::now());
                    scan.exhausted.push(exhausted);
                }
            }
        }

        tx.commit().await.map_err(|e| {
            PipelineError::Internal(format!("lease scan tx commit failed: {e}"))
        })?;
        Ok(scan)
    }
}

#[cfg(all(test, feature = "postgres-tests"))]
mod tests {
    use super::*;
    use crate::types::{ArtistId, TrackSubmission};

    fn request(max_attempts: u16) -> EnqueueRequest {
        EnqueueRequest {
            payload: TrackSubmission {
                title: "Song".into(),
                artist_id: ArtistId(1),
                duration_seconds: Some(90.0),
                source_audio_path: "/tmp/source.wav".into(),
                original_filename: "source.wav".into(),
                cover_image_path: None,
                external_track_refs: None,
            },
            max_attempts,
            backoff: BackoffPolicy::Fixed { delay_ms: 0 },
            retention: RetentionPolicy::default(),
        }
    }

    fn dequeue_request() -> DequeueRequest {
        DequeueRequest {
            worker_id: "test-w0".into(),
            lease_ttl: chrono::Duration::seconds(30),
        }
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn lease_complete_round(pool: PgPool) {
        let queue = PostgresQueueService::new(pool, RetryConfig::default())
            .await
            .unwrap();
        let handle = queue.enqueue(request(2)).await.unwrap();

        let lease = queue.dequeue(dequeue_request()).await.unwrap().unwrap();
        assert_eq!(lease.job.id, handle.id);
        assert!(queue.dequeue(dequeue_request()).await.unwrap().is_none());

        queue.report_progress(lease.lease_id, 45).await.unwrap();
        queue.report_progress(lease.lease_id, 25).await.unwrap();
        assert_eq!(queue.status(handle.id).await.unwrap().unwrap().progress, 45);

        let result = TrackArtifactSet {
            audio_url: "a".into(),
            cover_url: None,
            waveform_url: "w".into(),
            voice_timestamps_url: "t".into(),
            duration_seconds: 60,
        };
        queue.complete(lease.lease_id, result.clone()).await.unwrap();
        let status = queue.status(handle.id).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.result, Some(result));
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn retryable_failure_requeues_until_exhausted(pool: PgPool) {
        let queue = PostgresQueueService::new(pool, RetryConfig::default())
            .await
            .unwrap();
        let handle = queue.enqueue(request(2)).await.unwrap();

        let lease = queue.dequeue(dequeue_request()).await.unwrap().unwrap();
        let first = queue
            .fail(lease.lease_id, true, "ffmpeg timed out".into())
            .await
            .unwrap();
        assert!(matches!(first, FailureDisposition::RetryScheduled { attempts_made: 1, .. }));

        let lease = queue.dequeue(dequeue_request()).await.unwrap().unwrap();
        let second = queue
            .fail(lease.lease_id, true, "ffmpeg timed out".into())
            .await
            .unwrap();
        assert_eq!(second, FailureDisposition::Failed { attempts_made: 2 });
        let status = queue.status(handle.id).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.error.as_deref(), Some("ffmpeg timed out"));
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn expired_lease_is_redelivered(pool: PgPool) {
        let queue = PostgresQueueService::new(pool.clone(), RetryConfig::default())
            .await
            .unwrap();
        let handle = queue.enqueue(request(3)).await.unwrap();
        let lease = queue.dequeue(dequeue_request()).await.unwrap().unwrap();

        sqlx::query(
            "UPDATE pipeline_jobs SET lease_expires_at = NOW() - INTERVAL '1 second' WHERE id = $1",
        )
        .bind(handle.id.0)
        .execute(&pool)
        .await
        .unwrap();

        let scan = queue.scan_expired_leases().await.unwrap();
        assert_eq!(scan.requeued, 1);
        assert!(scan.exhausted.is_empty());
        assert!(queue.complete(lease.lease_id, TrackArtifactSet {
            audio_url: String::new(),
            cover_url: None,
            waveform_url: String::new(),
            voice_timestamps_url: String::new(),
            duration_seconds: 0,
        }).await.is_err());

        let again = queue.dequeue(dequeue_request()).await.unwrap().unwrap();
        assert_eq!(again.job.id, handle.id);
        assert_eq!(again.job.attempts_made, 1);
    }
}
