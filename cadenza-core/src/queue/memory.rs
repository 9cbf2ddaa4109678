use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::error::{PipelineError, Result};
use crate::types::{JobId, TrackArtifactSet};

use super::{
    DequeueRequest, EnqueueRequest, ExpiredLeaseScan, FailureDisposition,
    JobHandle, JobLease, JobRecord, JobState, JobStatus, LeaseExpiryScanner,
    LeaseId, LeaseRenewal, QueueService, STALLED_ERROR,
};

fn lease_deadline(now: DateTime<Utc>, ttl: chrono::Duration) -> DateTime<Utc> {
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, JobRecord>,
    leases: HashMap<LeaseId, (JobId, u32)>,
}

impl QueueState {
    fn leased_job(&mut self, lease_id: LeaseId) -> Result<&mut JobRecord> {
        let job_id = self
            .leases
            .get(&lease_id)
            .map(|(job_id, _)| *job_id)
            .ok_or_else(|| {
                PipelineError::NotFound(format!("lease {lease_id} not held"))
            })?;
        match self.jobs.get_mut(&job_id) {
            Some(job) if job.state == JobState::Active => Ok(job),
            _ => Err(PipelineError::NotFound(format!(
                "lease {lease_id} not held"
            ))),
        }
    }

    fn release(&mut self, lease_id: LeaseId) {
        self.leases.remove(&lease_id);
    }

    fn release_job(&mut self, job_id: JobId) {
        self.leases.retain(|_, (leased, _)| *leased != job_id);
    }

    /// Keeps only the newest `keep` finished jobs in `state`.
    fn prune(&mut self, state: JobState, keep: u32) {
        let mut finished: Vec<(DateTime<Utc>, JobId)> = self
            .jobs
            .values()
            .filter(|job| job.state == state)
            .map(|job| (job.finished_at.unwrap_or(job.updated_at), job.id))
            .collect();
        if finished.len() <= keep as usize {
            return;
        }
        finished.sort_by(|a, b| b.cmp(a));
        for (_, id) in finished.into_iter().skip(keep as usize) {
            self.jobs.remove(&id);
        }
    }
}

/// Process-local [`QueueService`] with the same semantics as the Postgres
/// backend. State is lost on restart.
#[derive(Clone)]
pub struct InMemoryQueueService {
    retry: RetryConfig,
    state: Arc<Mutex<QueueState>>,
}

impl fmt::Debug for InMemoryQueueService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryQueueService");
        debug.field("retry", &self.retry);
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("jobs", &state.jobs.len())
                    .field("leases", &state.leases.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl InMemoryQueueService {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// Full record of a job, including finished ones still retained.
    pub async fn get(&self, job_id: JobId) -> Option<JobRecord> {
        self.state.lock().await.jobs.get(&job_id).cloned()
    }

    pub async fn count_in_state(&self, state: JobState) -> usize {
        self.state
            .lock()
            .await
            .jobs
            .values()
            .filter(|job| job.state == state)
            .count()
    }

    /// Makes a backing-off job ready immediately.
    pub async fn promote(&self, job_id: JobId) -> bool {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.state == JobState::Waiting => {
                job.available_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    fn finish(
        state: &mut QueueState,
        job_id: JobId,
        terminal: JobState,
        now: DateTime<Utc>,
    ) {
        let keep = match state.jobs.get_mut(&job_id) {
            Some(job) => {
                job.state = terminal;
                job.lease_owner = None;
                job.lease_expires_at = None;
                job.finished_at = Some(now);
                job.updated_at = now;
                job.retention.keep_for(terminal)
            }
            None => None,
        };
        state.release_job(job_id);
        if let Some(keep) = keep {
            state.prune(terminal, keep);
        }
    }
}

#[async_trait]
impl QueueService for InMemoryQueueService {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle> {
        let job = JobRecord::new(JobId::new(), request, Utc::now());
        let handle = job.handle();
        self.state.lock().await.jobs.insert(job.id, job);
        debug!(job_id = %handle.id, "job enqueued");
        Ok(handle)
    }

    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<JobLease>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let next = state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Waiting && job.available_at <= now)
            .min_by_key(|job| (job.available_at, job.created_at, job.id))
            .map(|job| job.id);
        let Some(job_id) = next else {
            return Ok(None);
        };

        let lease_id = LeaseId::new();
        let expires_at = lease_deadline(now, request.lease_ttl);
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        job.state = JobState::Active;
        job.progress = 0;
        job.lease_owner = Some(request.worker_id.clone());
        job.lease_expires_at = Some(expires_at);
        job.updated_at = now;
        let record = job.clone();
        state.leases.insert(lease_id, (job_id, 0));

        Ok(Some(JobLease {
            lease_id,
            job: record,
            lease_owner: request.worker_id,
            expires_at,
            renewals: 0,
        }))
    }

    async fn renew(&self, renewal: LeaseRenewal) -> Result<JobLease> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let renewals = match state.leases.get_mut(&renewal.lease_id) {
            Some((_, renewals)) => {
                *renewals += 1;
                *renewals
            }
            None => {
                return Err(PipelineError::NotFound(
                    "lease not found or expired".into(),
                ));
            }
        };

        let job = state.leased_job(renewal.lease_id)?;
        match job.lease_expires_at {
            Some(expires) if expires > now => {}
            _ => {
                return Err(PipelineError::NotFound(
                    "lease not found or expired".into(),
                ));
            }
        }
        let expires_at = lease_deadline(now, renewal.extend_by);
        job.lease_expires_at = Some(expires_at);
        job.updated_at = now;

        Ok(JobLease {
            lease_id: renewal.lease_id,
            job: job.clone(),
            lease_owner: renewal.worker_id,
            expires_at,
            renewals,
        })
    }

    async fn report_progress(&self, lease_id: LeaseId, progress: u8) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state.leased_job(lease_id)?;
        job.progress = job.progress.max(progress.min(100));
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn complete(
        &self,
        lease_id: LeaseId,
        result: TrackArtifactSet,
    ) -> Result<()> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let job = state.leased_job(lease_id)?;
        job.progress = 100;
        job.result = Some(result);
        job.last_error = None;
        let job_id = job.id;
        state.release(lease_id);
        Self::finish(&mut state, job_id, JobState::Completed, now);
        info!(job_id = %job_id, "job completed");
        Ok(())
    }

    async fn fail(
        &self,
        lease_id: LeaseId,
        retryable: bool,
        error: String,
    ) -> Result<FailureDisposition> {
        let now = Utc::now();
        let max_backoff = self.retry.backoff_max_ms;
        let mut state = self.state.lock().await;
        let job = state.leased_job(lease_id)?;

        job.attempts_made = job.attempts_made.saturating_add(1);
        job.last_error = Some(error);
        let attempts_made = job.attempts_made;
        let job_id = job.id;

        if !retryable || attempts_made >= job.max_attempts {
            state.release(lease_id);
            Self::finish(&mut state, job_id, JobState::Failed, now);
            warn!(job_id = %job_id, attempts_made, retryable, "job failed permanently");
            return Ok(FailureDisposition::Failed { attempts_made });
        }

        let delay = job.backoff.delay_ms(attempts_made, max_backoff);
        let retry_at = job.backoff.retry_at(now, attempts_made, max_backoff);
        job.state = JobState::Waiting;
        job.available_at = retry_at;
        job.lease_owner = None;
        job.lease_expires_at = None;
        job.updated_at = now;
        state.release(lease_id);
        info!(job_id = %job_id, attempts_made, delay_ms = delay, "job rescheduled");
        Ok(FailureDisposition::RetryScheduled {
            attempts_made,
            retry_at,
        })
    }

    async fn status(&self, job_id: JobId) -> Result<Option<JobStatus>> {
        Ok(self
            .state
            .lock()
            .await
            .jobs
            .get(&job_id)
            .map(JobRecord::status))
    }
}

#[async_trait]
impl LeaseExpiryScanner for InMemoryQueueService {
    async fn scan_expired_leases(&self) -> Result<ExpiredLeaseScan> {
        let now = Utc::now();
        let max_backoff = self.retry.backoff_max_ms;
        let mut state = self.state.lock().await;
        let mut scan = ExpiredLeaseScan::default();

        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| {
                job.state == JobState::Active
                    && job.lease_expires_at.is_some_and(|at| at <= now)
            })
            .map(|job| job.id)
            .collect();

        for job_id in expired {
            state.release_job(job_id);
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            job.attempts_made = job.attempts_made.saturating_add(1);
            job.last_error = Some(STALLED_ERROR.to_string());

            if job.attempts_made >= job.max_attempts {
                // Snapshot before retention pruning can drop the record.
                let mut snapshot = job.clone();
                snapshot.state = JobState::Failed;
                snapshot.lease_owner = None;
                snapshot.lease_expires_at = None;
                snapshot.finished_at = Some(now);
                Self::finish(&mut state, job_id, JobState::Failed, now);
                scan.exhausted.push(snapshot);
                warn!(job_id = %job_id, "stalled job exhausted its attempts");
            } else {
                let delay = job.backoff.delay_ms(job.attempts_made, max_backoff);
                job.state = JobState::Waiting;
                job.available_at = job.backoff.retry_at(now, job.attempts_made, max_backoff);
                job.lease_owner = None;
                job.lease_expires_at = None;
                job.updated_at = now;
                scan.requeued += 1;
                info!(job_id = %job_id, delay_ms = delay, "stalled job requeued");
            }
        }

        Ok(scan)
    }
}
