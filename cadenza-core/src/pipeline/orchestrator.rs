use std::any::type_name_of_val;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::process::transcoder::TruncateSpec;
use crate::process::{AudioTranscoder, VoiceDetector};
use crate::queue::JobRecord;
use crate::storage::{ArtifactName, ArtifactStore, TrackLocation};
use crate::tracks::TrackRepository;
use crate::types::{NewTrackRecord, TrackArtifactSet, TrackUniqueId};
use crate::waveform::WaveformGenerator;

use super::inputs::resolve_staged_input;
use super::scratch::{JobScratch, remove_quietly};
use super::state::PipelineState;

const LOOKUP_ATTEMPTS: u32 = 3;
const LOOKUP_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Sink for the coarse progress values emitted at phase boundaries.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, progress: u8);
}

/// Discards progress.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopProgress;

#[async_trait]
impl ProgressReporter for NoopProgress {
    async fn report(&self, _progress: u8) {}
}

/// A failed attempt, as seen by the dispatcher.
#[derive(Debug, Error)]
#[error("{phase} failed: {error}")]
pub struct PipelineFailure {
    pub phase: PipelineState,
    #[source]
    pub error: PipelineError,
    /// Terminal cleanup already ran; the job must not be retried.
    pub terminal: bool,
}

/// Uploaded keys and their URLs, accumulated in upload order.
#[derive(Debug, Default)]
struct UploadedArtifacts {
    keys: Vec<String>,
    audio_url: Option<String>,
    cover_url: Option<String>,
    waveform_url: Option<String>,
    timestamps_url: Option<String>,
}

/// Tracks how far an attempt got, for failure handling.
#[derive(Debug)]
struct AttemptCursor {
    phase: PipelineState,
    source_consumed: bool,
}

impl AttemptCursor {
    fn enter(&mut self, phase: PipelineState) {
        if !self.phase.can_transition_to(phase) {
            debug!(from = %self.phase, to = %phase, "phase skipped ahead");
        }
        self.phase = phase;
    }
}

/// Runs the fixed phase sequence for one job attempt.
pub struct PipelineOrchestrator {
    config: Arc<PipelineConfig>,
    transcoder: Arc<dyn AudioTranscoder>,
    detector: Arc<dyn VoiceDetector>,
    artifacts: Arc<dyn ArtifactStore>,
    tracks: Arc<dyn TrackRepository>,
    waveform: Arc<WaveformGenerator>,
}

impl fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("media", &self.config.media)
            .field("transcoder", &type_name_of_val(self.transcoder.as_ref()))
            .field("detector", &type_name_of_val(self.detector.as_ref()))
            .field("artifacts", &type_name_of_val(self.artifacts.as_ref()))
            .field("tracks", &type_name_of_val(self.tracks.as_ref()))
            .field("waveform", &self.waveform)
            .finish()
    }
}

impl PipelineOrchestrator {
    pub fn new(
        config: Arc<PipelineConfig>,
        transcoder: Arc<dyn AudioTranscoder>,
        detector: Arc<dyn VoiceDetector>,
        artifacts: Arc<dyn ArtifactStore>,
        tracks: Arc<dyn TrackRepository>,
    ) -> Result<Self> {
        config.validate()?;
        let waveform = Arc::new(WaveformGenerator::new(config.waveform.clone())?);
        Ok(Self {
            config,
            transcoder,
            detector,
            artifacts,
            tracks,
            waveform,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Processes one attempt of `job`.
    ///
    /// On a terminal failure every uploaded artifact and every local file the
    /// job owns is gone before this returns. On a retryable failure only this
    /// attempt's intermediates are removed; the submitted source survives.
    pub async fn run(
        &self,
        job: &JobRecord,
        progress: &dyn ProgressReporter,
    ) -> std::result::Result<TrackArtifactSet, PipelineFailure> {
        self.run_leased(job, progress, &CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), but stops at the next phase boundary once
    /// `lease_lost` is cancelled. A superseded attempt removes only its own
    /// intermediates: uploads, rows and inputs belong to whichever worker
    /// holds the job now.
    pub async fn run_leased(
        &self,
        job: &JobRecord,
        progress: &dyn ProgressReporter,
        lease_lost: &CancellationToken,
    ) -> std::result::Result<TrackArtifactSet, PipelineFailure> {
        let span = info_span!(
            "pipeline",
            job_id = %job.id,
            attempt = job.current_attempt(),
            max_attempts = job.max_attempts
        );
        self.run_attempt(job, progress, lease_lost)
            .instrument(span)
            .await
    }

    async fn run_attempt(
        &self,
        job: &JobRecord,
        progress: &dyn ProgressReporter,
        lease_lost: &CancellationToken,
    ) -> std::result::Result<TrackArtifactSet, PipelineFailure> {
        let location = location_for(job);
        let mut cursor = AttemptCursor {
            phase: PipelineState::Received,
            source_consumed: false,
        };

        let mut scratch = match JobScratch::create(&self.config.media.work_dir, job.id).await {
            Ok(scratch) => scratch,
            Err(error) => return Err(self.fail_attempt(job, &location, &cursor, None, error).await),
        };

        match self
            .execute(job, &location, &mut scratch, progress, &mut cursor, lease_lost)
            .await
        {
            Ok(artifacts) => {
                cursor.enter(PipelineState::CleaningTemp);
                let removed = scratch.cleanup().await;
                self.release_inputs(job).await;
                progress.report(100).await;
                info!(
                    phase = %PipelineState::Completed,
                    removed_intermediates = removed,
                    track = %location,
                    "track processed"
                );
                Ok(artifacts)
            }
            Err(error) => Err(self
                .fail_attempt(job, &location, &cursor, Some(&mut scratch), error)
                .await),
        }
    }

    async fn execute(
        &self,
        job: &JobRecord,
        location: &TrackLocation,
        scratch: &mut JobScratch,
        progress: &dyn ProgressReporter,
        cursor: &mut AttemptCursor,
        lease_lost: &CancellationToken,
    ) -> Result<TrackArtifactSet> {
        let media = &self.config.media;
        let payload = &job.payload;

        // Received
        if let Some(existing) = self
            .tracks
            .find_by_unique_id(location.track_unique_id)
            .await?
        {
            info!(track_id = %existing.id, "track already persisted by an earlier attempt");
            return Ok(existing.artifact_set());
        }
        let source =
            resolve_staged_input(&media.upload_dir, &payload.source_audio_path, "source audio")
                .await?;
        let cover = match &payload.cover_image_path {
            Some(cover) => {
                Some(resolve_staged_input(&media.upload_dir, cover, "cover image").await?)
            }
            None => None,
        };
        self.phase_done(PipelineState::Received, progress).await;

        still_leased(lease_lost)?;
        cursor.enter(PipelineState::Truncating);
        let truncated = scratch.path("truncated", "mp3");
        self.transcoder
            .truncate_with_fade(&source, &truncated, TruncateSpec::from_media(media))
            .await?;
        if !media.retain_source_until_terminal {
            remove_quietly(&source).await;
            cursor.source_consumed = true;
        }
        self.phase_done(PipelineState::Truncating, progress).await;

        still_leased(lease_lost)?;
        cursor.enter(PipelineState::VoiceDetecting);
        let timestamps = scratch.path("timestamps", "json");
        let summary = self.detector.detect(&truncated, &timestamps).await?;
        info!(
            has_voice = summary.has_voice(),
            first_voice_second = summary.first_voice_second,
            segments = summary.voice_segments_count,
            "voice activity detected"
        );
        self.phase_done(PipelineState::VoiceDetecting, progress).await;

        still_leased(lease_lost)?;
        cursor.enter(PipelineState::Compressing);
        let compressed = scratch.path("compressed", "mp3");
        self.transcoder
            .compress(&truncated, &compressed, media.output_bitrate_kbps)
            .await?;
        scratch.discard(&truncated).await;
        self.phase_done(PipelineState::Compressing, progress).await;

        still_leased(lease_lost)?;
        cursor.enter(PipelineState::WaveformGenerating);
        let waveform = scratch.path("waveform", "json");
        self.write_waveform(&compressed, &waveform).await?;
        self.phase_done(PipelineState::WaveformGenerating, progress).await;

        still_leased(lease_lost)?;
        cursor.enter(PipelineState::Uploading);
        let uploaded = self
            .upload(location, &compressed, &waveform, &timestamps, cover.as_deref())
            .await?;
        self.phase_done(PipelineState::Uploading, progress).await;

        still_leased(lease_lost)?;
        cursor.enter(PipelineState::Persisting);
        let record = self.build_record(job, location, uploaded)?;
        let stored = self.tracks.insert_once(record).await?;
        info!(track_id = %stored.id, "track row persisted");
        self.phase_done(PipelineState::Persisting, progress).await;

        Ok(stored.artifact_set())
    }

    async fn phase_done(&self, phase: PipelineState, progress: &dyn ProgressReporter) {
        info!(phase = %phase, "phase finished");
        if let Some(value) = phase.progress_on_exit() {
            progress.report(value).await;
        }
    }

    async fn write_waveform(&self, audio: &Path, output: &Path) -> Result<()> {
        let sample_rate = self.waveform.params().sample_rate_hz;
        let samples = self.transcoder.decode_pcm(audio, sample_rate).await?;
        if samples.is_empty() {
            return Err(PipelineError::InvalidMedia(
                "decoded audio contains no samples".into(),
            ));
        }

        let generator = Arc::clone(&self.waveform);
        let frames = tokio::task::spawn_blocking(move || generator.generate(&samples))
            .await
            .map_err(|e| PipelineError::Internal(format!("waveform task failed: {e}")))?;
        debug!(frames = frames.len(), "waveform generated");

        let json = serde_json::to_vec(&frames)?;
        tokio::fs::write(output, json).await?;
        Ok(())
    }

    async fn upload(
        &self,
        location: &TrackLocation,
        audio: &Path,
        waveform: &Path,
        timestamps: &Path,
        cover: Option<&Path>,
    ) -> Result<UploadedArtifacts> {
        let mut uploaded = UploadedArtifacts::default();

        let mut plan: Vec<(ArtifactName, PathBuf)> = vec![
            (ArtifactName::Audio, audio.to_path_buf()),
            (ArtifactName::Waveform, waveform.to_path_buf()),
            (ArtifactName::Timestamps, timestamps.to_path_buf()),
        ];
        if let Some(cover) = cover {
            plan.push((ArtifactName::cover_for(cover), cover.to_path_buf()));
        }

        for (name, path) in plan {
            let key = location.key(&name);
            let url = self
                .artifacts
                .put_file(&key, &path, name.content_type())
                .await?;
            debug!(key = %key, "artifact uploaded");
            uploaded.keys.push(key);
            match name {
                ArtifactName::Audio => uploaded.audio_url = Some(url),
                ArtifactName::Waveform => uploaded.waveform_url = Some(url),
                ArtifactName::Timestamps => uploaded.timestamps_url = Some(url),
                ArtifactName::Cover { .. } => uploaded.cover_url = Some(url),
            }
        }

        info!(keys = uploaded.keys.len(), prefix = %location, "artifacts uploaded");
        Ok(uploaded)
    }

    fn build_record(
        &self,
        job: &JobRecord,
        location: &TrackLocation,
        uploaded: UploadedArtifacts,
    ) -> Result<NewTrackRecord> {
        let missing = |what: &str| {
            PipelineError::Invariant(format!("persist reached without an uploaded {what}"))
        };
        let payload = &job.payload;
        if payload.cover_image_path.is_some() && uploaded.cover_url.is_none() {
            return Err(missing("cover"));
        }

        Ok(NewTrackRecord {
            track_unique_id: location.track_unique_id,
            title: payload.title.clone(),
            artist_id: payload.artist_id,
            audio_url: uploaded.audio_url.ok_or_else(|| missing("audio"))?,
            cover_url: uploaded.cover_url,
            duration_seconds: self.config.media.max_duration_secs,
            waveform_url: uploaded.waveform_url.ok_or_else(|| missing("waveform"))?,
            voice_timestamps_url: uploaded
                .timestamps_url
                .ok_or_else(|| missing("timestamps"))?,
            external_refs: payload.external_track_refs.clone().unwrap_or_default(),
        })
    }

    async fn fail_attempt(
        &self,
        job: &JobRecord,
        location: &TrackLocation,
        cursor: &AttemptCursor,
        scratch: Option<&mut JobScratch>,
        error: PipelineError,
    ) -> PipelineFailure {
        if matches!(error, PipelineError::LeaseLost(_)) {
            warn!(phase = %cursor.phase, "attempt superseded; leaving the job to its new owner");
            if let Some(scratch) = scratch {
                scratch.cleanup().await;
            }
            return PipelineFailure {
                phase: cursor.phase,
                error,
                terminal: false,
            };
        }

        let terminal =
            !error.is_retryable() || job.is_final_attempt() || cursor.source_consumed;
        warn!(
            phase = %cursor.phase,
            class = ?error.class(),
            terminal,
            error = %error,
            "attempt failed"
        );

        if let Some(scratch) = scratch {
            scratch.cleanup().await;
        }
        if terminal {
            self.terminal_cleanup(job, location).await;
        } else {
            debug!(next = %PipelineState::after_failure(false), "leaving source for the next attempt");
        }

        PipelineFailure {
            phase: cursor.phase,
            error,
            terminal,
        }
    }

    /// Terminal cleanup for a job whose worker vanished on its last attempt.
    pub async fn abandon(&self, job: &JobRecord) {
        let location = location_for(job);
        let swept = JobScratch::sweep(&self.config.media.work_dir, job.id).await;
        debug!(job_id = %job.id, swept, "swept stalled intermediates");
        self.terminal_cleanup(job, &location).await;
    }

    async fn terminal_cleanup(&self, job: &JobRecord, location: &TrackLocation) {
        info!(phase = %PipelineState::TerminalCleanup, track = %location, "purging job artifacts");

        // A persisted row means the set is complete and referenced; keep it.
        match self.persisted_row_exists(location).await {
            Some(true) => {
                info!(track = %location, "track already persisted; remote artifacts kept")
            }
            Some(false) => match self.artifacts.delete_by_prefix(&location.prefix()).await {
                Ok(removed) => info!(removed, prefix = %location, "remote artifacts purged"),
                Err(err) => {
                    warn!(error = %err, prefix = %location, "failed to purge remote artifacts")
                }
            },
            None => tracing::error!(
                prefix = %location,
                "could not tell whether the track was persisted; remote artifacts left in place"
            ),
        }

        self.release_inputs(job).await;
        info!(phase = %PipelineState::Abandoned, "job abandoned");
    }

    /// `None` when the repository kept failing; purging then could orphan a
    /// row that does exist.
    async fn persisted_row_exists(&self, location: &TrackLocation) -> Option<bool> {
        for attempt in 1..=LOOKUP_ATTEMPTS {
            match self.tracks.find_by_unique_id(location.track_unique_id).await {
                Ok(row) => return Some(row.is_some()),
                Err(err) => {
                    warn!(attempt, error = %err, "persisted-track lookup failed");
                    if attempt < LOOKUP_ATTEMPTS {
                        tokio::time::sleep(LOOKUP_RETRY_DELAY).await;
                    }
                }
            }
        }
        None
    }

    /// Deletes the submitted source and cover once the job no longer needs
    /// them. Paths are resolved again so nothing outside the upload
    /// directory is ever removed.
    async fn release_inputs(&self, job: &JobRecord) {
        let payload = &job.payload;
        let inputs = std::iter::once((&payload.source_audio_path, "source audio"))
            .chain(payload.cover_image_path.iter().map(|cover| (cover, "cover image")));
        for (path, what) in inputs {
            match resolve_staged_input(&self.config.media.upload_dir, path, what).await {
                Ok(staged) => {
                    remove_quietly(&staged).await;
                }
                Err(err) => debug!(error = %err, "input left in place"),
            }
        }
    }
}

fn location_for(job: &JobRecord) -> TrackLocation {
    TrackLocation::new(job.payload.artist_id, TrackUniqueId::for_job(job.id))
}

fn still_leased(lease_lost: &CancellationToken) -> Result<()> {
    if lease_lost.is_cancelled() {
        return Err(PipelineError::LeaseLost(
            "the job was redelivered to another worker".into(),
        ));
    }
    Ok(())
}
