mod support;

use std::sync::Arc;
use std::time::Duration;

use cadenza_core::config::RetryConfig;
use cadenza_core::error::PipelineError;
use cadenza_core::pipeline::{JobDispatcher, PipelineDispatcher};
use cadenza_core::queue::{
    BackoffPolicy, DequeueRequest, EnqueueRequest, FailureDisposition,
    InMemoryQueueService, JobOptions, JobState, LeaseExpiryScanner, LeaseRenewal,
    QueueService, RetentionPolicy, STALLED_ERROR,
};
use cadenza_core::storage::{ArtifactStore, TrackLocation};
use cadenza_core::types::{ArtistId, TrackArtifactSet, TrackSubmission, TrackUniqueId};

use support::Harness;

fn submission(title: &str) -> TrackSubmission {
    TrackSubmission {
        title: title.into(),
        artist_id: ArtistId(7),
        duration_seconds: Some(90.0),
        source_audio_path: format!("/tmp/{title}.wav").into(),
        original_filename: format!("{title}.wav"),
        cover_image_path: None,
        external_track_refs: None,
    }
}

fn request(title: &str, attempts: u16) -> EnqueueRequest {
    EnqueueRequest::new(
        submission(title),
        &RetryConfig::default(),
        RetentionPolicy::default(),
    )
    .with_options(JobOptions {
        attempts: Some(attempts),
        backoff: Some(BackoffPolicy::Fixed { delay_ms: 0 }),
        retention: None,
    })
}

fn lease_for(ttl: chrono::Duration) -> DequeueRequest {
    DequeueRequest {
        worker_id: "test-w0".into(),
        lease_ttl: ttl,
    }
}

fn default_lease() -> DequeueRequest {
    lease_for(chrono::Duration::seconds(300))
}

fn artifacts() -> TrackArtifactSet {
    TrackArtifactSet {
        audio_url: "memory://a/audio.mp3".into(),
        cover_url: None,
        waveform_url: "memory://a/waveform.json".into(),
        voice_timestamps_url: "memory://a/timestamps.json".into(),
        duration_seconds: 60,
    }
}

#[tokio::test]
async fn a_job_is_leased_to_one_worker_at_a_time() {
    let queue = InMemoryQueueService::new(RetryConfig::default());
    let handle = queue.enqueue(request("one", 2)).await.unwrap();
    assert_eq!(handle.state, JobState::Waiting);

    let lease = queue.dequeue(default_lease()).await.unwrap().unwrap();
    assert_eq!(lease.job.id, handle.id);
    assert_eq!(lease.job.state, JobState::Active);
    assert!(queue.dequeue(default_lease()).await.unwrap().is_none());
}

#[tokio::test]
async fn oldest_ready_job_goes_first() {
    let queue = InMemoryQueueService::new(RetryConfig::default());
    let first = queue.enqueue(request("first", 2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    let second = queue.enqueue(request("second", 2)).await.unwrap();

    let a = queue.dequeue(default_lease()).await.unwrap().unwrap();
    let b = queue.dequeue(default_lease()).await.unwrap().unwrap();
    assert_eq!(a.job.id, first.id);
    assert_eq!(b.job.id, second.id);
}

#[tokio::test]
async fn progress_never_goes_backwards_within_an_attempt() {
    let queue = InMemoryQueueService::new(RetryConfig::default());
    let handle = queue.enqueue(request("p", 2)).await.unwrap();
    let lease = queue.dequeue(default_lease()).await.unwrap().unwrap();

    queue.report_progress(lease.lease_id, 45).await.unwrap();
    queue.report_progress(lease.lease_id, 25).await.unwrap();
    assert_eq!(queue.status(handle.id).await.unwrap().unwrap().progress, 45);

    queue.fail(lease.lease_id, true, "boom".into()).await.unwrap();
    let retry = queue.dequeue(default_lease()).await.unwrap().unwrap();
    assert_eq!(retry.job.progress, 0);
}

#[tokio::test]
async fn retryable_failure_waits_out_the_backoff() {
    let queue = InMemoryQueueService::new(RetryConfig::default());
    let handle = queue
        .enqueue(
            request("b", 3).with_options(JobOptions {
                backoff: Some(BackoffPolicy::Exponential { delay_ms: 5_000 }),
                ..JobOptions::default()
            }),
        )
        .await
        .unwrap();
    let lease = queue.dequeue(default_lease()).await.unwrap().unwrap();
    let before = chrono::Utc::now();

    let disposition = queue
        .fail(lease.lease_id, true, "ffmpeg timed out".into())
        .await
        .unwrap();

    let FailureDisposition::RetryScheduled {
        attempts_made,
        retry_at,
    } = disposition
    else {
        panic!("expected a retry, got {disposition:?}");
    };
    assert_eq!(attempts_made, 1);
    assert!(retry_at >= before + chrono::Duration::milliseconds(4_900));
    assert!(queue.dequeue(default_lease()).await.unwrap().is_none());

    let status = queue.status(handle.id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Waiting);
    assert_eq!(status.error.as_deref(), Some("ffmpeg timed out"));

    assert!(queue.promote(handle.id).await);
    let again = queue.dequeue(default_lease()).await.unwrap().unwrap();
    assert_eq!(again.job.attempts_made, 1);
}

#[tokio::test]
async fn non_retryable_failure_skips_remaining_attempts() {
    let queue = InMemoryQueueService::new(RetryConfig::default());
    let handle = queue.enqueue(request("bad", 5)).await.unwrap();
    let lease = queue.dequeue(default_lease()).await.unwrap().unwrap();

    let disposition = queue
        .fail(lease.lease_id, false, "the uploaded audio could not be processed".into())
        .await
        .unwrap();

    assert_eq!(disposition, FailureDisposition::Failed { attempts_made: 1 });
    assert_eq!(
        queue.status(handle.id).await.unwrap().unwrap().state,
        JobState::Failed
    );
}

#[tokio::test]
async fn final_attempt_failure_is_terminal() {
    let queue = InMemoryQueueService::new(RetryConfig::default());
    queue.enqueue(request("twice", 2)).await.unwrap();

    let lease = queue.dequeue(default_lease()).await.unwrap().unwrap();
    assert!(!queue.fail(lease.lease_id, true, "x".into()).await.unwrap().is_terminal());
    let lease = queue.dequeue(default_lease()).await.unwrap().unwrap();
    assert!(queue.fail(lease.lease_id, true, "x".into()).await.unwrap().is_terminal());
    assert!(queue.dequeue(default_lease()).await.unwrap().is_none());
}

#[tokio::test]
async fn completion_releases_the_lease() {
    let queue = InMemoryQueueService::new(RetryConfig::default());
    let handle = queue.enqueue(request("done", 2)).await.unwrap();
    let lease = queue.dequeue(default_lease()).await.unwrap().unwrap();

    queue.complete(lease.lease_id, artifacts()).await.unwrap();

    let status = queue.status(handle.id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.progress, 100);
    assert_eq!(status.result, Some(artifacts()));
    assert!(matches!(
        queue.complete(lease.lease_id, artifacts()).await,
        Err(PipelineError::NotFound(_))
    ));
    assert!(matches!(
        queue
            .renew(LeaseRenewal {
                lease_id: lease.lease_id,
                worker_id: "test-w0".into(),
                extend_by: chrono::Duration::seconds(300),
            })
            .await,
        Err(PipelineError::NotFound(_))
    ));
}

#[tokio::test]
async fn renewal_pushes_the_expiry_out() {
    let queue = InMemoryQueueService::new(RetryConfig::default());
    queue.enqueue(request("long", 2)).await.unwrap();
    let lease = queue
        .dequeue(lease_for(chrono::Duration::seconds(10)))
        .await
        .unwrap()
        .unwrap();

    let renewed = queue
        .renew(LeaseRenewal {
            lease_id: lease.lease_id,
            worker_id: "test-w0".into(),
            extend_by: chrono::Duration::seconds(300),
        })
        .await
        .unwrap();

    assert!(renewed.expires_at > lease.expires_at);
    assert_eq!(renewed.renewals, 1);
}

#[tokio::test]
async fn stalled_lease_is_redelivered_as_a_new_attempt() {
    let queue = InMemoryQueueService::new(RetryConfig::default());
    let handle = queue.enqueue(request("stall", 3)).await.unwrap();
    let stale = queue
        .dequeue(lease_for(chrono::Duration::milliseconds(1)))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let scan = queue.scan_expired_leases().await.unwrap();
    assert_eq!(scan.requeued, 1);
    assert!(scan.exhausted.is_empty());

    assert!(matches!(
        queue.complete(stale.lease_id, artifacts()).await,
        Err(PipelineError::NotFound(_))
    ));
    let fresh = queue.dequeue(default_lease()).await.unwrap().unwrap();
    assert_eq!(fresh.job.id, handle.id);
    assert_eq!(fresh.job.attempts_made, 1);
    assert_eq!(fresh.job.last_error.as_deref(), Some(STALLED_ERROR));
}

#[tokio::test]
async fn finished_jobs_are_pruned_by_retention() {
    let queue = InMemoryQueueService::new(RetryConfig::default());
    let retention = JobOptions {
        retention: Some(RetentionPolicy {
            keep_completed: 2,
            keep_failed: 2,
        }),
        ..JobOptions::default()
    };

    let mut ids = Vec::new();
    for title in ["a", "b", "c"] {
        let handle = queue
            .enqueue(request(title, 2).with_options(retention))
            .await
            .unwrap();
        ids.push(handle.id);
        let lease = queue.dequeue(default_lease()).await.unwrap().unwrap();
        queue.complete(lease.lease_id, artifacts()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert!(queue.status(ids[0]).await.unwrap().is_none());
    assert!(queue.status(ids[1]).await.unwrap().is_some());
    assert!(queue.status(ids[2]).await.unwrap().is_some());
    assert_eq!(queue.count_in_state(JobState::Completed).await, 2);
}

#[tokio::test]
async fn stalled_final_attempt_is_handed_back_for_cleanup() {
    let h = Harness::new();
    let queue = Arc::new(InMemoryQueueService::new(h.config.queue.retry));
    let dispatcher = PipelineDispatcher::new(Arc::clone(&h.orchestrator), queue.clone());

    let payload = h.submission(90.0, false).await;
    let source = payload.source_audio_path.clone();
    let handle = queue
        .enqueue(
            EnqueueRequest::new(payload, &h.config.queue.retry, h.config.queue.retention)
                .with_options(JobOptions {
                    attempts: Some(1),
                    ..JobOptions::default()
                }),
        )
        .await
        .unwrap();
    let lease = queue
        .dequeue(lease_for(chrono::Duration::milliseconds(1)))
        .await
        .unwrap()
        .unwrap();

    // The vanished worker got as far as one upload.
    let location = TrackLocation::new(lease.job.payload.artist_id, TrackUniqueId::for_job(handle.id));
    h.store
        .put(&format!("{}audio.mp3", location.prefix()), b"partial".to_vec(), "audio/mpeg")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let scan = queue.scan_expired_leases().await.unwrap();
    assert_eq!(scan.requeued, 0);
    assert_eq!(scan.exhausted.len(), 1);
    assert_eq!(scan.exhausted[0].state, JobState::Failed);

    for job in &scan.exhausted {
        dispatcher.abandon(job).await;
    }

    assert!(h.store.list(&location.prefix()).await.unwrap().is_empty());
    assert!(!source.exists());
    let status = queue.status(handle.id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.error.as_deref(), Some(STALLED_ERROR));
}
