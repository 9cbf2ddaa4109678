use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::queue::{BackoffPolicy, RetentionPolicy};
use crate::waveform::WaveformParams;

/// Longest lease a worker may hold between renewals.
pub const MAX_LEASE_TTL_SECS: i64 = 24 * 60 * 60;
/// Longest delay any retry may be pushed back.
pub const MAX_BACKOFF_MS: u64 = 7 * 24 * 60 * 60 * 1_000;

/// Explicit context handed to the queue services, the orchestrator and the
/// worker runtime.
///
/// Every field carries a default so a deployment only has to spell out what
/// it changes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker slots, polling, leases, retries and retention.
    pub queue: QueueConfig,
    /// Output shaping and scratch storage.
    pub media: MediaConfig,
    /// External audio transcoder invocation.
    pub transcoder: TranscoderConfig,
    /// External voice-activity detector invocation.
    pub voice_detector: VoiceDetectorConfig,
    /// Spectral waveform parameters.
    pub waveform: WaveformParams,
}

impl PipelineConfig {
    /// Rejects combinations that would let the queue redeliver a job while
    /// a healthy worker is still inside one external-process call.
    pub fn validate(&self) -> Result<()> {
        let lease = self.queue.lease.ttl();

        if self.queue.worker_slots == 0 {
            return Err(PipelineError::Config(
                "queue.worker_slots must be at least 1".into(),
            ));
        }
        if self.queue.retry.max_attempts == 0 {
            return Err(PipelineError::Config(
                "queue.retry.max_attempts must be at least 1".into(),
            ));
        }
        if !(1..=MAX_LEASE_TTL_SECS).contains(&self.queue.lease.lease_ttl_secs) {
            return Err(PipelineError::Config(format!(
                "queue.lease.lease_ttl_secs must be between 1 and {MAX_LEASE_TTL_SECS}"
            )));
        }
        if self.queue.lease.housekeeper_interval_ms == 0 || self.queue.poll_interval_ms == 0 {
            return Err(PipelineError::Config(
                "queue.poll_interval_ms and queue.lease.housekeeper_interval_ms must be positive"
                    .into(),
            ));
        }
        if self.queue.retry.backoff_max_ms > MAX_BACKOFF_MS {
            return Err(PipelineError::Config(format!(
                "queue.retry.backoff_max_ms must not exceed {MAX_BACKOFF_MS}"
            )));
        }
        if !(0.0..1.0).contains(&self.queue.lease.renew_at_fraction) {
            return Err(PipelineError::Config(
                "queue.lease.renew_at_fraction must be in [0, 1)".into(),
            ));
        }
        if self.transcoder.timeout() >= lease {
            return Err(PipelineError::Config(format!(
                "transcoder.timeout_secs ({}) must be shorter than the lease ttl ({}s)",
                self.transcoder.timeout_secs, self.queue.lease.lease_ttl_secs
            )));
        }
        if self.voice_detector.timeout() >= lease {
            return Err(PipelineError::Config(format!(
                "voice_detector.timeout_secs ({}) must be shorter than the lease ttl ({}s)",
                self.voice_detector.timeout_secs, self.queue.lease.lease_ttl_secs
            )));
        }
        if self.media.max_duration_secs == 0 {
            return Err(PipelineError::Config(
                "media.max_duration_secs must be positive".into(),
            ));
        }
        if self.media.fade_out_secs >= self.media.max_duration_secs {
            return Err(PipelineError::Config(
                "media.fade_out_secs must be shorter than media.max_duration_secs"
                    .into(),
            ));
        }
        self.waveform.validate()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Concurrent jobs per worker process. Each slot runs one job at a time.
    pub worker_slots: usize,
    /// Sleep between empty dequeue polls (ms).
    pub poll_interval_ms: u64,
    pub lease: LeaseConfig,
    pub retry: RetryConfig,
    pub retention: RetentionPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_slots: 1,
            poll_interval_ms: 500,
            lease: LeaseConfig::default(),
            retry: RetryConfig::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Lease/heartbeat tuning for worker slots.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// TTL granted on dequeue and on every renewal (seconds)
    pub lease_ttl_secs: i64,
    /// Renew when remaining TTL drops below this fraction of the TTL (e.g. 0.5)
    pub renew_at_fraction: f32,
    /// Minimum margin before expiry to trigger a renewal regardless of fraction (ms)
    pub renew_min_margin_ms: u64,
    /// Cadence for scanning expired leases (ms)
    pub housekeeper_interval_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 300,
            renew_at_fraction: 0.5,
            renew_min_margin_ms: 2_000,
            housekeeper_interval_ms: 30_000,
        }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs.max(0) as u64)
    }

    pub fn chrono_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_secs)
    }

    pub fn housekeeper_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeper_interval_ms)
    }
}

/// Default retry policy applied to submissions that do not carry their own.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u16,
    pub backoff: BackoffPolicy,
    /// Upper bound for any computed backoff delay.
    pub backoff_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: BackoffPolicy::Exponential { delay_ms: 5_000 },
            backoff_max_ms: 10 * 60 * 1_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Output length cap. Every published track is exactly this long at most.
    pub max_duration_secs: u32,
    /// Fade-out length ending at the cap.
    pub fade_out_secs: u32,
    /// Bitrate of the truncated intermediate.
    pub intermediate_bitrate_kbps: u32,
    /// Bitrate of the published audio.
    pub output_bitrate_kbps: u32,
    /// Directory for per-job intermediates.
    pub work_dir: PathBuf,
    /// Staging area for submitted sources and covers. Inputs must resolve
    /// inside it; they are deleted once their job no longer needs them.
    pub upload_dir: PathBuf,
    /// Keep the uploaded source until the job is terminal so every retry
    /// restarts from the original input. When false the source is deleted
    /// right after truncation and later failures are terminal.
    pub retain_source_until_terminal: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: 60,
            fade_out_secs: 5,
            intermediate_bitrate_kbps: 192,
            output_bitrate_kbps: 128,
            work_dir: std::env::temp_dir().join("cadenza"),
            upload_dir: std::env::temp_dir().join("cadenza-uploads"),
            retain_source_until_terminal: true,
        }
    }
}

impl MediaConfig {
    /// Second at which the fade-out starts.
    pub fn fade_start_secs(&self) -> u32 {
        self.max_duration_secs.saturating_sub(self.fade_out_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub ffmpeg_path: PathBuf,
    pub timeout_secs: u64,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            timeout_secs: 120,
        }
    }
}

impl TranscoderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// The detector is invoked as `program args... <input> <output>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceDetectorConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub timeout_secs: u64,
}

impl Default for VoiceDetectorConfig {
    fn default() -> Self {
        let mut env = HashMap::new();
        env.insert("TF_CPP_MIN_LOG_LEVEL".to_string(), "2".to_string());
        Self {
            program: PathBuf::from("python3"),
            args: vec!["scripts/voice_finder.py".to_string()],
            env,
            timeout_secs: 120,
        }
    }
}

impl VoiceDetectorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
