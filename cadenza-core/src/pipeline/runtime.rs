use std::any::{type_name, type_name_of_val};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::error::PipelineError;
use crate::queue::{
    DequeueRequest, FailureDisposition, JobLease, LeaseExpiryScanner, LeaseRenewal,
    QueueService,
};

use super::dispatcher::{DispatchStatus, JobDispatcher};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const RENEW_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Supervises the worker slots and the lease housekeeper of one process.
pub struct WorkerRuntime<Q>
where
    Q: QueueService + LeaseExpiryScanner + 'static,
{
    config: QueueConfig,
    queue: Arc<Q>,
    dispatcher: Arc<dyn JobDispatcher>,
    worker_group: String,
    shutdown_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<Q> fmt::Debug for WorkerRuntime<Q>
where
    Q: QueueService + LeaseExpiryScanner + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_handle_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("WorkerRuntime")
            .field("config", &self.config)
            .field("queue_type", &type_name::<Q>())
            .field("dispatcher_type", &type_name_of_val(self.dispatcher.as_ref()))
            .field("worker_group", &self.worker_group)
            .field("worker_handle_count", &worker_handle_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl<Q> WorkerRuntime<Q>
where
    Q: QueueService + LeaseExpiryScanner + 'static,
{
    pub fn new(
        config: QueueConfig,
        queue: Arc<Q>,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> Self {
        Self {
            config,
            queue,
            dispatcher,
            worker_group: format!("pipeline-{}", std::process::id()),
            shutdown_token: CancellationToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self) -> Arc<Q> {
        Arc::clone(&self.queue)
    }

    /// Cancelling this token drains the runtime: in-flight jobs finish,
    /// nothing new is leased.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub async fn start(&self) {
        let slots = self.config.worker_slots.max(1);
        for slot in 0..slots {
            let handle = self.spawn_worker(slot);
            self.worker_handles.lock().await.push(handle);
        }
        let housekeeper = self.spawn_housekeeper();
        self.worker_handles.lock().await.push(housekeeper);
        tracing::info!(
            worker_group = %self.worker_group,
            slots,
            "worker runtime started"
        );
    }

    /// Signals shutdown and waits for every loop to exit.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!("worker task ended abnormally: {err}");
                }
                Err(_) => {
                    tracing::warn!("worker did not stop within {SHUTDOWN_GRACE:?}");
                }
            }
        }
        tracing::info!(worker_group = %self.worker_group, "worker runtime stopped");
    }

    fn spawn_worker(&self, slot: usize) -> JoinHandle<()> {
        let worker_id = format!("{}-w{}", self.worker_group, slot);
        let queue = Arc::clone(&self.queue);
        let dispatcher = Arc::clone(&self.dispatcher);
        let shutdown = self.shutdown_token.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            loop {
                if shutdown.is_cancelled() {
                    tracing::info!("Worker {} shutting down", worker_id);
                    break;
                }

                let dequeue = DequeueRequest {
                    worker_id: worker_id.clone(),
                    lease_ttl: config.lease.chrono_ttl(),
                };

                let lease = match queue.dequeue(dequeue).await {
                    Ok(Some(lease)) => lease,
                    Ok(None) => {
                        idle(&shutdown, config.poll_interval()).await;
                        continue;
                    }
                    Err(err) => {
                        tracing::error!(worker = %worker_id, "dequeue failed: {err}");
                        idle(&shutdown, config.poll_interval()).await;
                        continue;
                    }
                };

                tracing::info!(
                    worker = %worker_id,
                    job_id = %lease.job.id,
                    lease = %lease.lease_id,
                    attempt = lease.job.current_attempt(),
                    "job leased"
                );
                process_lease(&*queue, &*dispatcher, &config, &worker_id, lease).await;
            }
        })
    }

    fn spawn_housekeeper(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let dispatcher = Arc::clone(&self.dispatcher);
        let shutdown = self.shutdown_token.clone();
        let interval = self.config.lease.housekeeper_interval();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Lease housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }

                match queue.scan_expired_leases().await {
                    Ok(scan) => {
                        if scan.requeued > 0 || !scan.exhausted.is_empty() {
                            tracing::info!(
                                requeued = scan.requeued,
                                exhausted = scan.exhausted.len(),
                                "recovered stalled leases"
                            );
                        }
                        for job in &scan.exhausted {
                            dispatcher.abandon(job).await;
                        }
                    }
                    Err(err) => {
                        tracing::warn!("lease expiry scan failed: {err}");
                    }
                }
            }
        })
    }
}

async fn idle(shutdown: &CancellationToken, wait: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(wait) => {}
    }
}

/// Runs one leased job under a renewal heartbeat and reports the outcome.
async fn process_lease<Q>(
    queue: &Q,
    dispatcher: &dyn JobDispatcher,
    config: &QueueConfig,
    worker_id: &str,
    lease: JobLease,
) where
    Q: QueueService + ?Sized,
{
    let lease_id = lease.lease_id;
    let job_id = lease.job.id;
    let (cancel_tx, mut cancel_rx) = tokio::sync::mpsc::channel::<()>(1);
    let lease_lost = CancellationToken::new();

    let heartbeat = async {
        let ttl = config.lease.chrono_ttl();
        let ttl_total = config.lease.ttl();
        let renew_margin = Duration::from_millis(config.lease.renew_min_margin_ms);
        let renew_fraction = config.lease.renew_at_fraction;
        let mut local_expires_at = lease.expires_at;

        loop {
            // Sleep until the remaining TTL drops to the renewal target.
            let now = chrono::Utc::now();
            let mut sleep_dur = Duration::from_millis(500);
            if local_expires_at > now {
                let target = ttl_total.mul_f32(1.0 - renew_fraction);
                let remaining = (local_expires_at - now)
                    .to_std()
                    .unwrap_or(Duration::from_millis(0));
                sleep_dur = if remaining > target {
                    remaining - target
                } else if remaining > renew_margin {
                    remaining - renew_margin
                } else {
                    Duration::from_millis(0)
                };
            }

            tokio::select! {
                _ = tokio::time::sleep(sleep_dur) => {},
                _ = cancel_rx.recv() => { break; }
            }

            match queue
                .renew(LeaseRenewal {
                    lease_id,
                    worker_id: worker_id.to_string(),
                    extend_by: ttl,
                })
                .await
            {
                Ok(updated) => {
                    local_expires_at = updated.expires_at;
                    tracing::trace!(
                        lease = %lease_id,
                        renewals = updated.renewals,
                        expires_at = %updated.expires_at,
                        "lease renewed"
                    );
                }
                Err(PipelineError::NotFound(_)) => {
                    tracing::warn!(
                        lease = %lease_id,
                        job_id = %job_id,
                        "lease lost while job was running"
                    );
                    lease_lost.cancel();
                    break;
                }
                Err(err) => {
                    tracing::warn!("lease renew failed: {err}");
                    // Keep trying; the housekeeper reclaims it if we never get through.
                    tokio::select! {
                        _ = tokio::time::sleep(RENEW_RETRY_DELAY) => {},
                        _ = cancel_rx.recv() => { break; }
                    }
                }
            }
        }
    };

    let work = async {
        let status = dispatcher.dispatch(&lease, lease_lost.clone()).await;
        let _ = cancel_tx.try_send(());
        status
    };

    let (dispatch_status, ()) = tokio::join!(work, heartbeat);

    match dispatch_status {
        DispatchStatus::Success { result } => {
            match queue.complete(lease_id, result).await {
                Ok(()) => tracing::info!(job_id = %job_id, "job completed"),
                Err(PipelineError::NotFound(_)) => tracing::warn!(
                    job_id = %job_id,
                    "lease expired before completion was recorded; job will be redelivered"
                ),
                Err(err) => tracing::error!("queue complete error: {err}"),
            }
        }
        DispatchStatus::Retry { error } => {
            match queue.fail(lease_id, true, error).await {
                Ok(FailureDisposition::RetryScheduled {
                    attempts_made,
                    retry_at,
                }) => {
                    tracing::info!(
                        job_id = %job_id,
                        attempts_made,
                        retry_at = %retry_at,
                        "job scheduled for retry"
                    );
                }
                Ok(FailureDisposition::Failed { attempts_made }) => {
                    // The queue saw this as the last attempt; nothing else will clean up.
                    tracing::warn!(job_id = %job_id, attempts_made, "retry refused by queue");
                    dispatcher.abandon(&lease.job).await;
                }
                Err(err) => tracing::error!("queue fail error: {err}"),
            }
        }
        DispatchStatus::Failed { error } => {
            match queue.fail(lease_id, false, error).await {
                Ok(_) => tracing::warn!(job_id = %job_id, "job failed permanently"),
                Err(err) => tracing::error!("queue fail error: {err}"),
            }
        }
        DispatchStatus::LeaseLost => {
            tracing::warn!(job_id = %job_id, "attempt stopped after its lease was lost");
        }
    }
}
