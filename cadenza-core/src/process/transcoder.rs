use std::ffi::OsString;
use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::config::{MediaConfig, TranscoderConfig};
use crate::error::Result;

use super::{ToolInvocation, run_tool};

/// Shape of the truncate+fade phase output.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TruncateSpec {
    pub max_duration_secs: u32,
    pub fade_out_secs: u32,
    pub bitrate_kbps: u32,
}

impl TruncateSpec {
    pub fn from_media(media: &MediaConfig) -> Self {
        Self {
            max_duration_secs: media.max_duration_secs,
            fade_out_secs: media.fade_out_secs,
            bitrate_kbps: media.intermediate_bitrate_kbps,
        }
    }

    pub fn fade_start_secs(&self) -> u32 {
        self.max_duration_secs.saturating_sub(self.fade_out_secs)
    }

    /// ffmpeg audio filter ending the fade exactly at the cap.
    pub fn fade_filter(&self) -> String {
        format!(
            "afade=t=out:st={}:d={}",
            self.fade_start_secs(),
            self.fade_out_secs
        )
    }
}

/// Audio conversions the pipeline needs from an external transcoder.
#[async_trait]
pub trait AudioTranscoder: Send + Sync {
    /// Caps `input` to `spec.max_duration_secs`, fading out over the last
    /// `spec.fade_out_secs`, and writes an MP3 to `output`.
    async fn truncate_with_fade(
        &self,
        input: &Path,
        output: &Path,
        spec: TruncateSpec,
    ) -> Result<()>;

    /// Re-encodes `input` to an MP3 at `bitrate_kbps`.
    async fn compress(
        &self,
        input: &Path,
        output: &Path,
        bitrate_kbps: u32,
    ) -> Result<()>;

    /// Decodes to mono signed 16-bit PCM at `sample_rate_hz`.
    async fn decode_pcm(
        &self,
        input: &Path,
        sample_rate_hz: u32,
    ) -> Result<Vec<i16>>;
}

/// [`AudioTranscoder`] backed by the `ffmpeg` binary.
#[derive(Clone, Debug)]
pub struct FfmpegTranscoder {
    config: TranscoderConfig,
}

impl FfmpegTranscoder {
    pub fn new(config: TranscoderConfig) -> Self {
        Self { config }
    }

    fn base(&self, input: &Path) -> ToolInvocation {
        ToolInvocation::new(
            "ffmpeg",
            self.config.ffmpeg_path.clone(),
            self.config.timeout(),
        )
        .args(["-hide_banner", "-nostdin", "-loglevel", "error", "-y", "-i"])
        .arg(input.as_os_str())
    }

    /// Arguments following `-i <input>` for the truncate+fade encode.
    pub fn truncate_args(output: &Path, spec: TruncateSpec) -> Vec<OsString> {
        vec![
            "-t".into(),
            spec.max_duration_secs.to_string().into(),
            "-af".into(),
            spec.fade_filter().into(),
            "-codec:a".into(),
            "libmp3lame".into(),
            "-b:a".into(),
            format!("{}k", spec.bitrate_kbps).into(),
            "-vn".into(),
            output.into(),
        ]
    }

    pub fn ffmpeg_path(&self) -> &Path {
        &self.config.ffmpeg_path
    }
}

#[async_trait]
impl AudioTranscoder for FfmpegTranscoder {
    async fn truncate_with_fade(
        &self,
        input: &Path,
        output: &Path,
        spec: TruncateSpec,
    ) -> Result<()> {
        let invocation =
            self.base(input).args(Self::truncate_args(output, spec));
        let out = run_tool(&invocation).await?;
        debug!(
            elapsed_ms = out.elapsed.as_millis() as u64,
            output = %output.display(),
            "truncated audio"
        );
        Ok(())
    }

    async fn compress(
        &self,
        input: &Path,
        output: &Path,
        bitrate_kbps: u32,
    ) -> Result<()> {
        let invocation = self
            .base(input)
            .args(["-codec:a", "libmp3lame", "-b:a"])
            .arg(format!("{bitrate_kbps}k"))
            .arg("-vn")
            .arg(output.as_os_str());
        let out = run_tool(&invocation).await?;
        debug!(
            elapsed_ms = out.elapsed.as_millis() as u64,
            output = %output.display(),
            "compressed audio"
        );
        Ok(())
    }

    async fn decode_pcm(
        &self,
        input: &Path,
        sample_rate_hz: u32,
    ) -> Result<Vec<i16>> {
        let invocation = self
            .base(input)
            .args(["-ac", "1", "-ar"])
            .arg(sample_rate_hz.to_string())
            .args(["-f", "s16le", "-c:a", "pcm_s16le", "-map", "0:a", "-"]);
        let out = run_tool(&invocation).await?;
        Ok(pcm_from_le_bytes(&out.stdout))
    }
}

/// Interprets raw `s16le` bytes. A dangling odd byte is ignored.
pub fn pcm_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
