use std::any::type_name_of_val;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::error::PipelineError;
use crate::queue::{JobLease, JobRecord, LeaseId, QueueService};
use crate::types::TrackArtifactSet;

use super::orchestrator::{PipelineOrchestrator, ProgressReporter};

/// Outcome of dispatcher execution for a single job.
#[derive(Clone, Debug, PartialEq)]
pub enum DispatchStatus {
    Success { result: TrackArtifactSet },
    /// Attempt failed; the source is intact and the job may run again.
    Retry { error: String },
    /// Attempt failed and terminal cleanup already ran.
    Failed { error: String },
    /// The lease was lost mid-run and the attempt stopped at a phase
    /// boundary. Nothing must be reported for it.
    LeaseLost,
}

/// Contract exposed to worker loops for executing leased jobs.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Runs the leased job. `lease_lost` is cancelled by the heartbeat when
    /// the queue no longer recognises the lease.
    async fn dispatch(&self, lease: &JobLease, lease_lost: CancellationToken) -> DispatchStatus;

    /// Terminal cleanup for a job that ran out of attempts without a
    /// worker to clean up after it.
    async fn abandon(&self, job: &JobRecord);
}

/// Reports orchestrator progress against the lease that owns the job.
struct LeaseProgress {
    queue: Arc<dyn QueueService>,
    lease_id: LeaseId,
}

#[async_trait]
impl ProgressReporter for LeaseProgress {
    async fn report(&self, progress: u8) {
        if let Err(err) = self.queue.report_progress(self.lease_id, progress).await {
            // Advisory only
            warn!(lease = %self.lease_id, progress, error = %err, "progress update failed");
        } else {
            trace!(lease = %self.lease_id, progress, "progress reported");
        }
    }
}

/// [`JobDispatcher`] running every job through the [`PipelineOrchestrator`].
#[derive(Clone)]
pub struct PipelineDispatcher {
    orchestrator: Arc<PipelineOrchestrator>,
    queue: Arc<dyn QueueService>,
}

impl fmt::Debug for PipelineDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineDispatcher")
            .field("orchestrator", &self.orchestrator)
            .field("queue", &type_name_of_val(self.queue.as_ref()))
            .finish()
    }
}

impl PipelineDispatcher {
    pub fn new(
        orchestrator: Arc<PipelineOrchestrator>,
        queue: Arc<dyn QueueService>,
    ) -> Self {
        Self {
            orchestrator,
            queue,
        }
    }
}

#[async_trait]
impl JobDispatcher for PipelineDispatcher {
    async fn dispatch(&self, lease: &JobLease, lease_lost: CancellationToken) -> DispatchStatus {
        let progress = LeaseProgress {
            queue: Arc::clone(&self.queue),
            lease_id: lease.lease_id,
        };

        match self
            .orchestrator
            .run_leased(&lease.job, &progress, &lease_lost)
            .await
        {
            Ok(result) => DispatchStatus::Success { result },
            Err(failure) if matches!(failure.error, PipelineError::LeaseLost(_)) => {
                DispatchStatus::LeaseLost
            }
            Err(failure) => {
                let error = format!("{}: {}", failure.phase, failure.error.summary());
                if failure.terminal {
                    DispatchStatus::Failed { error }
                } else {
                    DispatchStatus::Retry { error }
                }
            }
        }
    }

    async fn abandon(&self, job: &JobRecord) {
        self.orchestrator.abandon(job).await;
    }
}
