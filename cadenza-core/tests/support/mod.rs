#![allow(dead_code)]

//! In-process stand-ins for ffmpeg, the voice detector and flaky backends.
//!
//! Fake audio files are small text files: `duration=<seconds>` plus whatever
//! each stage appends. Decoding synthesises a sine of that length.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use cadenza_core::error::{PipelineError, Result};
use cadenza_core::pipeline::{PipelineOrchestrator, ProgressReporter};
use cadenza_core::process::transcoder::TruncateSpec;
use cadenza_core::process::{AudioTranscoder, VoiceActivitySummary, VoiceDetector};
use cadenza_core::queue::{
    BackoffPolicy, DequeueRequest, EnqueueRequest, ExpiredLeaseScan, FailureDisposition,
    InMemoryQueueService, JobHandle, JobLease, JobRecord, JobStatus, LeaseExpiryScanner,
    LeaseId, LeaseRenewal, QueueService, RetentionPolicy,
};
use cadenza_core::storage::{ArtifactStore, MemoryArtifactStore};
use cadenza_core::tracks::{InMemoryTrackRepository, TrackRepository};
use cadenza_core::types::{
    ArtistId, JobId, NewTrackRecord, TrackArtifactSet, TrackId, TrackRecord,
    TrackSubmission, TrackUniqueId,
};
use cadenza_core::waveform::WaveformParams;
use cadenza_core::PipelineConfig;
use tokio::sync::Mutex;

pub fn parse_duration(text: &str) -> Option<f64> {
    text.lines()
        .find_map(|line| line.strip_prefix("duration="))
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value >= 0.0)
}

fn rejected(stderr: &str) -> PipelineError {
    PipelineError::ToolRejected {
        tool: "ffmpeg".into(),
        code: 1,
        stderr: stderr.into(),
    }
}

async fn read_duration(path: &Path) -> Result<f64> {
    let text = tokio::fs::read_to_string(path).await?;
    parse_duration(&text)
        .ok_or_else(|| rejected("Invalid data found when processing input"))
}

#[derive(Debug, Default)]
pub struct FakeTranscoder {
    /// Compress calls that fail with a timeout before one succeeds.
    pub compress_failures: AtomicUsize,
    pub truncate_calls: AtomicUsize,
    pub compress_calls: AtomicUsize,
    /// Wall-clock time each compress takes.
    pub compress_delay: Duration,
}

impl FakeTranscoder {
    pub fn failing_compress(times: usize) -> Self {
        Self {
            compress_failures: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    pub fn slow_compress(delay: Duration) -> Self {
        Self {
            compress_delay: delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl AudioTranscoder for FakeTranscoder {
    async fn truncate_with_fade(
        &self,
        input: &Path,
        output: &Path,
        spec: TruncateSpec,
    ) -> Result<()> {
        self.truncate_calls.fetch_add(1, Ordering::SeqCst);
        let duration = read_duration(input).await?;
        let capped = duration.min(f64::from(spec.max_duration_secs));
        let body = format!("duration={capped}\n{}\n", spec.fade_filter());
        tokio::fs::write(output, body).await?;
        Ok(())
    }

    async fn compress(
        &self,
        input: &Path,
        output: &Path,
        bitrate_kbps: u32,
    ) -> Result<()> {
        self.compress_calls.fetch_add(1, Ordering::SeqCst);
        if !self.compress_delay.is_zero() {
            tokio::time::sleep(self.compress_delay).await;
        }
        let remaining = self.compress_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.compress_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PipelineError::ToolTimedOut {
                tool: "ffmpeg".into(),
                timeout_ms: 120_000,
            });
        }
        let mut body = tokio::fs::read_to_string(input).await?;
        body.push_str(&format!("bitrate={bitrate_kbps}k\n"));
        tokio::fs::write(output, body).await?;
        Ok(())
    }

    async fn decode_pcm(&self, input: &Path, sample_rate_hz: u32) -> Result<Vec<i16>> {
        let duration = read_duration(input).await?;
        let count = (duration * f64::from(sample_rate_hz)) as usize;
        let rate = f64::from(sample_rate_hz);
        Ok((0..count)
            .map(|i| {
                let t = i as f64 / rate;
                (8_000.0 * (2.0 * std::f64::consts::PI * 440.0 * t).sin()) as i16
            })
            .collect())
    }
}

/// Reports one voiced segment starting at 1.5s.
#[derive(Debug, Default)]
pub struct FakeVoiceDetector {
    pub calls: AtomicUsize,
    /// Calls that time out before one succeeds.
    pub timeouts: AtomicUsize,
}

#[async_trait]
impl VoiceDetector for FakeVoiceDetector {
    async fn detect(&self, audio: &Path, output: &Path) -> Result<VoiceActivitySummary> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.timeouts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.timeouts.store(remaining - 1, Ordering::SeqCst);
            return Err(PipelineError::ToolTimedOut {
                tool: "voice-detector".into(),
                timeout_ms: 60_000,
            });
        }
        let duration = read_duration(audio).await?;
        let summary = VoiceActivitySummary {
            first_voice_second: 1.5,
            total_voice_duration: (duration - 1.5).max(0.0),
            voice_segments_count: 1,
            audio_duration: duration,
        };
        tokio::fs::write(output, serde_json::to_vec(&summary)?).await?;
        Ok(summary)
    }
}

/// Memory store whose puts fail for keys ending in `fail_suffix`.
#[derive(Debug, Clone)]
pub struct FlakyStore {
    pub inner: MemoryArtifactStore,
    fail_suffix: String,
    pub failed_puts: Arc<AtomicUsize>,
}

impl FlakyStore {
    pub fn failing_on(suffix: &str) -> Self {
        Self {
            inner: MemoryArtifactStore::default(),
            fail_suffix: suffix.into(),
            failed_puts: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl ArtifactStore for FlakyStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        if key.ends_with(&self.fail_suffix) {
            self.failed_puts.fetch_add(1, Ordering::SeqCst);
            return Err(PipelineError::Storage(format!("connection reset uploading {key}")));
        }
        self.inner.put(key, bytes, content_type).await
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize> {
        self.inner.delete_by_prefix(prefix).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }

    fn public_url_for(&self, key: &str) -> String {
        self.inner.public_url_for(key)
    }
}

/// Track repository whose inserts always fail, as if the database went away
/// right after the uploads.
#[derive(Debug, Default)]
pub struct UnreachableTracks {
    pub inner: InMemoryTrackRepository,
    pub insert_attempts: AtomicUsize,
}

#[async_trait]
impl TrackRepository for UnreachableTracks {
    async fn insert_once(&self, _record: NewTrackRecord) -> Result<TrackRecord> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        Err(PipelineError::Internal("connection refused".into()))
    }

    async fn find_by_unique_id(
        &self,
        track_unique_id: TrackUniqueId,
    ) -> Result<Option<TrackRecord>> {
        self.inner.find_by_unique_id(track_unique_id).await
    }

    async fn get(&self, id: TrackId) -> Result<Option<TrackRecord>> {
        self.inner.get(id).await
    }

    async fn delete(&self, id: TrackId) -> Result<Option<TrackRecord>> {
        self.inner.delete(id).await
    }
}

/// Track repository that cannot answer lookups.
#[derive(Debug, Default)]
pub struct BlindTracks {
    pub inner: InMemoryTrackRepository,
    pub lookups: AtomicUsize,
}

#[async_trait]
impl TrackRepository for BlindTracks {
    async fn insert_once(&self, record: NewTrackRecord) -> Result<TrackRecord> {
        self.inner.insert_once(record).await
    }

    async fn find_by_unique_id(
        &self,
        _track_unique_id: TrackUniqueId,
    ) -> Result<Option<TrackRecord>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Err(PipelineError::Internal("statement timeout".into()))
    }

    async fn get(&self, id: TrackId) -> Result<Option<TrackRecord>> {
        self.inner.get(id).await
    }

    async fn delete(&self, id: TrackId) -> Result<Option<TrackRecord>> {
        self.inner.delete(id).await
    }
}

/// In-memory queue that has forgotten every lease by the first renewal, as
/// if another worker had already taken the job over.
#[derive(Debug)]
pub struct ForgetfulQueue {
    pub inner: InMemoryQueueService,
    pub renewals: AtomicUsize,
}

impl ForgetfulQueue {
    pub fn new(inner: InMemoryQueueService) -> Self {
        Self {
            inner,
            renewals: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl QueueService for ForgetfulQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle> {
        self.inner.enqueue(request).await
    }

    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<JobLease>> {
        self.inner.dequeue(request).await
    }

    async fn renew(&self, renewal: LeaseRenewal) -> Result<JobLease> {
        self.renewals.fetch_add(1, Ordering::SeqCst);
        Err(PipelineError::NotFound(format!("lease {}", renewal.lease_id)))
    }

    async fn report_progress(&self, lease_id: LeaseId, progress: u8) -> Result<()> {
        self.inner.report_progress(lease_id, progress).await
    }

    async fn complete(&self, lease_id: LeaseId, result: TrackArtifactSet) -> Result<()> {
        self.inner.complete(lease_id, result).await
    }

    async fn fail(
        &self,
        lease_id: LeaseId,
        retryable: bool,
        error: String,
    ) -> Result<FailureDisposition> {
        self.inner.fail(lease_id, retryable, error).await
    }

    async fn status(&self, job_id: JobId) -> Result<Option<JobStatus>> {
        self.inner.status(job_id).await
    }
}

#[async_trait]
impl LeaseExpiryScanner for ForgetfulQueue {
    async fn scan_expired_leases(&self) -> Result<ExpiredLeaseScan> {
        self.inner.scan_expired_leases().await
    }
}

#[derive(Debug, Default)]
pub struct RecordingProgress {
    pub values: Mutex<Vec<u8>>,
}

#[async_trait]
impl ProgressReporter for RecordingProgress {
    async fn report(&self, progress: u8) {
        self.values.lock().await.push(progress);
    }
}

/// Small analysis window so synthetic minute-long clips stay cheap.
pub fn test_waveform_params() -> WaveformParams {
    WaveformParams {
        sample_rate_hz: 8_000,
        frame_size: 1_024,
        hop_size: 256,
        max_frequency_hz: 3_500.0,
        ..WaveformParams::default()
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub config: Arc<PipelineConfig>,
    pub transcoder: Arc<FakeTranscoder>,
    pub detector: Arc<FakeVoiceDetector>,
    pub store: Arc<dyn ArtifactStore>,
    pub tracks: Arc<dyn TrackRepository>,
    pub orchestrator: Arc<PipelineOrchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(
            FakeTranscoder::default(),
            Arc::new(MemoryArtifactStore::default()),
            Arc::new(InMemoryTrackRepository::new()),
            |_| {},
        )
    }

    pub fn build(
        transcoder: FakeTranscoder,
        store: Arc<dyn ArtifactStore>,
        tracks: Arc<dyn TrackRepository>,
        tweak: impl FnOnce(&mut PipelineConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.media.work_dir = dir.path().join("work");
        config.media.upload_dir = dir.path().join("uploads");
        std::fs::create_dir_all(&config.media.upload_dir).unwrap();
        config.waveform = test_waveform_params();
        config.queue.poll_interval_ms = 10;
        config.queue.retry.backoff = BackoffPolicy::Fixed { delay_ms: 0 };
        tweak(&mut config);
        let config = Arc::new(config);

        let transcoder = Arc::new(transcoder);
        let detector = Arc::new(FakeVoiceDetector::default());
        let orchestrator = Arc::new(
            PipelineOrchestrator::new(
                Arc::clone(&config),
                transcoder.clone(),
                detector.clone(),
                Arc::clone(&store),
                Arc::clone(&tracks),
            )
            .unwrap(),
        );

        Self {
            dir,
            config,
            transcoder,
            detector,
            store,
            tracks,
            orchestrator,
        }
    }

    pub fn work_dir(&self) -> PathBuf {
        self.config.media.work_dir.clone()
    }

    /// Stages an upload of `duration_secs` seconds, plus a PNG cover when asked.
    pub async fn submission(&self, duration_secs: f64, with_cover: bool) -> TrackSubmission {
        let uploads = self.config.media.upload_dir.clone();
        let stem = uuid::Uuid::new_v4();

        let source = uploads.join(format!("{stem}.wav"));
        tokio::fs::write(&source, format!("duration={duration_secs}\n"))
            .await
            .unwrap();

        let cover = if with_cover {
            let cover = uploads.join(format!("{stem}.PNG"));
            tokio::fs::write(&cover, b"\x89PNG fake").await.unwrap();
            Some(cover)
        } else {
            None
        };

        TrackSubmission {
            title: "Night Drive".into(),
            artist_id: ArtistId(42),
            duration_seconds: Some(duration_secs),
            source_audio_path: source,
            original_filename: "night-drive.wav".into(),
            cover_image_path: cover,
            external_track_refs: None,
        }
    }

    /// A job as the queue would hand it over on attempt `attempts_made + 1`.
    pub fn job(
        &self,
        payload: TrackSubmission,
        attempts_made: u16,
        max_attempts: u16,
    ) -> JobRecord {
        let mut job = JobRecord::new(
            JobId::new(),
            EnqueueRequest {
                payload,
                max_attempts,
                backoff: BackoffPolicy::Fixed { delay_ms: 0 },
                retention: RetentionPolicy::default(),
            },
            Utc::now(),
        );
        job.attempts_made = attempts_made;
        job
    }

    pub async fn work_dir_entries(&self) -> Vec<PathBuf> {
        let mut entries = Vec::new();
        let Ok(mut dir) = tokio::fs::read_dir(self.work_dir()).await else {
            return entries;
        };
        while let Some(entry) = dir.next_entry().await.unwrap() {
            entries.push(entry.path());
        }
        entries
    }
}

/// Polls until the job reaches a terminal queue state.
pub async fn wait_for_terminal<Q>(queue: &Q, job_id: JobId) -> cadenza_core::queue::JobStatus
where
    Q: QueueService + ?Sized,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(status) = queue.status(job_id).await.unwrap()
            && status.state.is_terminal()
        {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} did not finish in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
