use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::types::{JobId, TrackArtifactSet, TrackSubmission};

/// Queue-visible lifecycle of a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Ready now, or parked until `available_at` after a failed attempt.
    Waiting,
    /// Leased to a worker.
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state {other:?}")),
        }
    }
}

/// Delay before the next attempt of a failed job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum BackoffPolicy {
    Fixed {
        #[serde(alias = "delay_ms")]
        delay_ms: u64,
    },
    /// `delay_ms * 2^(n-1)` after the n-th failure.
    Exponential {
        #[serde(alias = "delay_ms")]
        delay_ms: u64,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential { delay_ms: 5_000 }
    }
}

impl BackoffPolicy {
    /// Delay after `failures` failed attempts (1-based), capped at `max_ms`.
    pub fn delay_ms(&self, failures: u16, max_ms: u64) -> u64 {
        if failures == 0 {
            return 0;
        }
        let delay = match *self {
            BackoffPolicy::Fixed { delay_ms } => delay_ms,
            BackoffPolicy::Exponential { delay_ms } => {
                let exp = u32::from(failures.saturating_sub(1)).min(63);
                delay_ms.saturating_mul(1u64 << exp)
            }
        };
        delay.min(max_ms)
    }

    /// When a job that failed `failures` times becomes ready again. Saturates
    /// at the latest representable instant.
    pub fn retry_at(&self, now: DateTime<Utc>, failures: u16, max_ms: u64) -> DateTime<Utc> {
        let delay = i64::try_from(self.delay_ms(failures, max_ms)).unwrap_or(i64::MAX);
        chrono::Duration::try_milliseconds(delay)
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// How many finished jobs the queue keeps for status polling.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetentionPolicy {
    #[serde(alias = "keep_completed")]
    pub keep_completed: u32,
    #[serde(alias = "keep_failed")]
    pub keep_failed: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_completed: 100,
            keep_failed: 200,
        }
    }
}

impl RetentionPolicy {
    pub fn keep_for(&self, state: JobState) -> Option<u32> {
        match state {
            JobState::Completed => Some(self.keep_completed),
            JobState::Failed => Some(self.keep_failed),
            _ => None,
        }
    }
}

/// Per-submission overrides of the queue defaults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    #[serde(default)]
    pub attempts: Option<u16>,
    #[serde(default)]
    pub backoff: Option<BackoffPolicy>,
    #[serde(default)]
    pub retention: Option<RetentionPolicy>,
}

/// A submission ready to be admitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub payload: TrackSubmission,
    pub max_attempts: u16,
    pub backoff: BackoffPolicy,
    pub retention: RetentionPolicy,
}

impl EnqueueRequest {
    pub fn new(
        payload: TrackSubmission,
        retry: &RetryConfig,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            payload,
            max_attempts: retry.max_attempts.max(1),
            backoff: retry.backoff,
            retention,
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        if let Some(attempts) = options.attempts {
            self.max_attempts = attempts.max(1);
        }
        if let Some(backoff) = options.backoff {
            self.backoff = backoff;
        }
        if let Some(retention) = options.retention {
            self.retention = retention;
        }
        self
    }
}

/// Returned by enqueue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: JobId,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
}

/// Queue bookkeeping for one job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub payload: TrackSubmission,
    pub state: JobState,
    /// Attempts that ended in failure (or a stalled lease).
    pub attempts_made: u16,
    pub max_attempts: u16,
    pub backoff: BackoffPolicy,
    pub retention: RetentionPolicy,
    pub progress: u8,
    pub available_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub result: Option<TrackArtifactSet>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(id: JobId, request: EnqueueRequest, now: DateTime<Utc>) -> Self {
        Self {
            id,
            payload: request.payload,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: request.max_attempts.max(1),
            backoff: request.backoff,
            retention: request.retention,
            progress: 0,
            available_at: now,
            lease_owner: None,
            lease_expires_at: None,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// 1-based number of the attempt currently running (or next to run).
    pub fn current_attempt(&self) -> u16 {
        self.attempts_made.saturating_add(1)
    }

    /// Whether a failure of the current attempt exhausts the job.
    pub fn is_final_attempt(&self) -> bool {
        self.current_attempt() >= self.max_attempts
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id,
            state: self.state,
            created_at: self.created_at,
        }
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.id,
            state: self.state,
            progress: self.progress,
            attempts_made: self.attempts_made,
            max_attempts: self.max_attempts,
            result: self.result.clone(),
            error: self.last_error.clone(),
        }
    }
}

/// Snapshot returned to pollers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub progress: u8,
    pub attempts_made: u16,
    pub max_attempts: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TrackArtifactSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What the queue did with a failed attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FailureDisposition {
    RetryScheduled {
        attempts_made: u16,
        retry_at: DateTime<Utc>,
    },
    Failed {
        attempts_made: u16,
    },
}

impl FailureDisposition {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailureDisposition::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::Exponential { delay_ms: 5_000 };
        assert_eq!(policy.delay_ms(0, u64::MAX), 0);
        assert_eq!(policy.delay_ms(1, u64::MAX), 5_000);
        assert_eq!(policy.delay_ms(2, u64::MAX), 10_000);
        assert_eq!(policy.delay_ms(3, u64::MAX), 20_000);
        assert_eq!(policy.delay_ms(10, 60_000), 60_000);
        assert_eq!(policy.delay_ms(u16::MAX, u64::MAX), u64::MAX);
    }

    #[test]
    fn retry_at_saturates_instead_of_overflowing() {
        let now = Utc::now();
        let policy = BackoffPolicy::Exponential { delay_ms: u64::MAX };
        assert_eq!(policy.retry_at(now, 3, u64::MAX), DateTime::<Utc>::MAX_UTC);

        let fixed = BackoffPolicy::Fixed { delay_ms: 1_500 };
        assert_eq!(
            fixed.retry_at(now, 1, 60_000),
            now + chrono::Duration::milliseconds(1_500)
        );
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = BackoffPolicy::Fixed { delay_ms: 250 };
        assert_eq!(policy.delay_ms(1, 10_000), 250);
        assert_eq!(policy.delay_ms(7, 10_000), 250);
    }

    #[test]
    fn backoff_uses_the_submission_wire_shape() {
        let policy: BackoffPolicy =
            serde_json::from_str(r#"{"type": "exponential", "delayMs": 2000}"#)
                .unwrap();
        assert_eq!(policy, BackoffPolicy::Exponential { delay_ms: 2_000 });
        let json = serde_json::to_value(BackoffPolicy::Fixed { delay_ms: 1 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "fixed", "delayMs": 1}));
    }

    #[test]
    fn options_override_defaults() {
        let payload = TrackSubmission {
            title: "t".into(),
            artist_id: crate::types::ArtistId(1),
            duration_seconds: None,
            source_audio_path: "/tmp/a.wav".into(),
            original_filename: "a.wav".into(),
            cover_image_path: None,
            external_track_refs: None,
        };
        let request = EnqueueRequest::new(
            payload,
            &RetryConfig::default(),
            RetentionPolicy::default(),
        )
        .with_options(JobOptions {
            attempts: Some(0),
            backoff: Some(BackoffPolicy::Fixed { delay_ms: 10 }),
            retention: None,
        });
        assert_eq!(request.max_attempts, 1);
        assert_eq!(request.backoff, BackoffPolicy::Fixed { delay_ms: 10 });
        assert_eq!(request.retention, RetentionPolicy::default());
    }
}
