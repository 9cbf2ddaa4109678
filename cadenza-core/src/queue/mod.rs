//! Durable work queue.
//!
//! Jobs are admitted as `waiting`, leased one at a time per worker slot as
//! `active`, and end up `completed` or `failed`. A failed attempt returns the
//! job to `waiting` behind a backoff delay until its attempts run out. Leases
//! that are not renewed expire and the job is redelivered.

pub mod job;
pub mod lease;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{JobId, TrackArtifactSet};

pub use job::{
    BackoffPolicy, EnqueueRequest, FailureDisposition, JobHandle, JobOptions,
    JobRecord, JobState, JobStatus, RetentionPolicy,
};
pub use lease::{DequeueRequest, JobLease, LeaseId, LeaseRenewal};
pub use memory::InMemoryQueueService;
#[cfg(feature = "postgres")]
pub use postgres::PostgresQueueService;

/// Queue backend consumed by the API layer and the worker runtime.
#[async_trait]
pub trait QueueService: Send + Sync {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle>;

    /// Leases the oldest ready job, if any.
    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<JobLease>>;

    /// Extends a live lease. Returns `NotFound` once the lease is gone.
    async fn renew(&self, renewal: LeaseRenewal) -> Result<JobLease>;

    /// Advisory progress for pollers; never lowers the stored value.
    async fn report_progress(&self, lease_id: LeaseId, progress: u8) -> Result<()>;

    async fn complete(
        &self,
        lease_id: LeaseId,
        result: TrackArtifactSet,
    ) -> Result<()>;

    /// Records a failed attempt. Non-retryable failures and the final
    /// attempt move the job to `failed`; otherwise it is rescheduled.
    async fn fail(
        &self,
        lease_id: LeaseId,
        retryable: bool,
        error: String,
    ) -> Result<FailureDisposition>;

    async fn status(&self, job_id: JobId) -> Result<Option<JobStatus>>;
}

/// Outcome of one sweep over expired leases.
#[derive(Clone, Debug, Default)]
pub struct ExpiredLeaseScan {
    /// Jobs returned to `waiting` for another attempt.
    pub requeued: u64,
    /// Jobs whose expired lease was their final attempt. Now `failed`; the
    /// caller owns their terminal cleanup.
    pub exhausted: Vec<JobRecord>,
}

/// Stalled-lease recovery, run periodically by the housekeeper.
#[async_trait]
pub trait LeaseExpiryScanner: Send + Sync {
    async fn scan_expired_leases(&self) -> Result<ExpiredLeaseScan>;
}

/// Error text recorded when a worker vanished mid-job.
pub const STALLED_ERROR: &str = "job stalled: lease expired before completion";
