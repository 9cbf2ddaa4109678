use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::VoiceDetectorConfig;
use crate::error::{PipelineError, Result};

use super::{ToolInvocation, run_tool};

const TOOL: &str = "voice-detector";

/// Summary written by the detector and published as `timestamps.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoiceActivitySummary {
    /// Start of the first voiced segment; `0` when no voice was found.
    pub first_voice_second: f64,
    pub total_voice_duration: f64,
    pub voice_segments_count: u32,
    pub audio_duration: f64,
}

impl VoiceActivitySummary {
    pub fn has_voice(&self) -> bool {
        self.voice_segments_count > 0
    }

    fn check(&self) -> std::result::Result<(), String> {
        let fields = [
            ("first_voice_second", self.first_voice_second),
            ("total_voice_duration", self.total_voice_duration),
            ("audio_duration", self.audio_duration),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{name} is not a non-negative number: {value}"));
            }
        }
        Ok(())
    }
}

/// Voice-activity detection over an audio file.
#[async_trait]
pub trait VoiceDetector: Send + Sync {
    /// Analyses `audio` and leaves the summary JSON at `output`.
    async fn detect(
        &self,
        audio: &Path,
        output: &Path,
    ) -> Result<VoiceActivitySummary>;
}

/// Runs a detector program as `program args... <audio> <output>` and
/// validates what it wrote.
#[derive(Clone, Debug)]
pub struct CommandVoiceDetector {
    config: VoiceDetectorConfig,
}

impl CommandVoiceDetector {
    pub fn new(config: VoiceDetectorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl VoiceDetector for CommandVoiceDetector {
    async fn detect(
        &self,
        audio: &Path,
        output: &Path,
    ) -> Result<VoiceActivitySummary> {
        let invocation = ToolInvocation::new(
            TOOL,
            self.config.program.clone(),
            self.config.timeout(),
        )
        .args(self.config.args.iter().cloned())
        .arg(audio.as_os_str())
        .arg(output.as_os_str())
        .envs(&self.config.env);

        let out = run_tool(&invocation).await?;
        let stdout = String::from_utf8_lossy(&out.stdout);
        if !stdout.trim().is_empty() {
            debug!(stdout = %stdout.trim_end(), "voice detector output");
        }

        let summary = read_summary(output).await?;
        info!(
            segments = summary.voice_segments_count,
            first_voice_second = summary.first_voice_second,
            elapsed_ms = out.elapsed.as_millis() as u64,
            "voice detection finished"
        );
        Ok(summary)
    }
}

/// Loads and checks a summary file written by a detector.
pub async fn read_summary(path: &Path) -> Result<VoiceActivitySummary> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PipelineError::ToolOutput {
                tool: TOOL.into(),
                detail: format!("no summary written at {}", path.display()),
            });
        }
        Err(e) => return Err(e.into()),
    };

    let summary: VoiceActivitySummary =
        serde_json::from_slice(&bytes).map_err(|e| PipelineError::ToolOutput {
            tool: TOOL.into(),
            detail: format!("malformed summary: {e}"),
        })?;
    summary.check().map_err(|detail| PipelineError::ToolOutput {
        tool: TOOL.into(),
        detail,
    })?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_a_valid_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timestamps.json");
        tokio::fs::write(
            &path,
            br#"{"first_voice_second": 12.5, "total_voice_duration": 30.25,
                 "voice_segments_count": 4, "audio_duration": 60.0}"#,
        )
        .await
        .unwrap();

        let summary = read_summary(&path).await.unwrap();
        assert!(summary.has_voice());
        assert_eq!(summary.voice_segments_count, 4);
    }

    #[tokio::test]
    async fn missing_file_is_a_tool_output_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_summary(&dir.path().join("absent.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ToolOutput { .. }));
    }

    #[tokio::test]
    async fn negative_durations_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timestamps.json");
        tokio::fs::write(
            &path,
            br#"{"first_voice_second": -1, "total_voice_duration": 0,
                 "voice_segments_count": 0, "audio_duration": 60}"#,
        )
        .await
        .unwrap();
        let err = read_summary(&path).await.unwrap_err();
        assert!(err.to_string().contains("first_voice_second"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_detector_passes_paths_last() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("in.mp3");
        let output = dir.path().join("out.json");
        tokio::fs::write(&audio, b"fake").await.unwrap();

        let config = VoiceDetectorConfig {
            program: "sh".into(),
            args: vec![
                "-c".into(),
                r#"printf '{"first_voice_second":0,"total_voice_duration":0,"voice_segments_count":0,"audio_duration":60}' > "$2""#
                    .into(),
                "detector".into(),
            ],
            env: Default::default(),
            timeout_secs: 5,
        };
        let summary = CommandVoiceDetector::new(config)
            .detect(&audio, &output)
            .await
            .unwrap();
        assert!(!summary.has_voice());
        assert!(output.exists());
    }
}
