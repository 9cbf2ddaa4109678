//! Spectral waveform generation.
//!
//! Mono PCM is cut into overlapping Hann-windowed frames. Each frame's
//! magnitude spectrum is folded into a small number of perceptually spaced
//! visual bins, smoothed across neighbours, log-normalised and quantised to
//! one byte per bin. The result is what the player draws as its scrub bar.

use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

use rustfft::{Fft, FftPlanner, num_complex::Complex};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub const SAMPLE_RATE_HZ: u32 = 44_100;
pub const FFT_FRAME_SIZE: usize = 8_192;
pub const FFT_HOP_SIZE: usize = FFT_FRAME_SIZE / 4;
pub const VISUAL_BINS: usize = 64;
pub const FREQUENCY_GAMMA: f64 = 3.0;
pub const MIN_FREQUENCY_HZ: f64 = 10.0;
pub const MAX_FREQUENCY_HZ: f64 = 14_000.0;
pub const VOLUME_SENSITIVITY_EXPONENT: f64 = 5.0;
pub const SMOOTHING_WEIGHTS: [f64; 3] = [0.25, 0.50, 0.25];

/// One analysis window of the waveform artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WaveformFrame {
    /// Start of the window in seconds.
    pub time: f64,
    /// Quantised magnitude per visual bin, lowest frequency first.
    pub frequencies: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveformParams {
    pub sample_rate_hz: u32,
    pub frame_size: usize,
    pub hop_size: usize,
    pub visual_bins: usize,
    pub gamma: f64,
    pub min_frequency_hz: f64,
    pub max_frequency_hz: f64,
    pub volume_sensitivity: f64,
    pub smoothing_weights: [f64; 3],
}

impl Default for WaveformParams {
    fn default() -> Self {
        Self {
            sample_rate_hz: SAMPLE_RATE_HZ,
            frame_size: FFT_FRAME_SIZE,
            hop_size: FFT_HOP_SIZE,
            visual_bins: VISUAL_BINS,
            gamma: FREQUENCY_GAMMA,
            min_frequency_hz: MIN_FREQUENCY_HZ,
            max_frequency_hz: MAX_FREQUENCY_HZ,
            volume_sensitivity: VOLUME_SENSITIVITY_EXPONENT,
            smoothing_weights: SMOOTHING_WEIGHTS,
        }
    }
}

impl WaveformParams {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate_hz == 0 {
            return Err(PipelineError::Config(
                "waveform.sample_rate_hz must be positive".into(),
            ));
        }
        if self.frame_size < 2 || self.hop_size == 0 {
            return Err(PipelineError::Config(
                "waveform.frame_size must be >= 2 and waveform.hop_size > 0"
                    .into(),
            ));
        }
        if self.visual_bins == 0 || self.visual_bins > u16::MAX as usize {
            return Err(PipelineError::Config(
                "waveform.visual_bins out of range".into(),
            ));
        }
        if self.gamma <= 0.0 || self.volume_sensitivity <= 0.0 {
            return Err(PipelineError::Config(
                "waveform.gamma and waveform.volume_sensitivity must be positive"
                    .into(),
            ));
        }
        if self.min_frequency_hz < 0.0
            || self.max_frequency_hz <= self.min_frequency_hz
        {
            return Err(PipelineError::Config(
                "waveform frequency band is empty".into(),
            ));
        }
        Ok(())
    }

    /// Number of full windows that fit in `sample_count` samples.
    /// A trailing partial window is dropped.
    pub fn frame_count(&self, sample_count: usize) -> usize {
        if sample_count < self.frame_size {
            0
        } else {
            (sample_count - self.frame_size) / self.hop_size + 1
        }
    }
}

/// Reusable generator. Holds the FFT plan, the window and the bin map so
/// repeated calls only pay for the transforms themselves.
#[derive(Clone)]
pub struct WaveformGenerator {
    params: WaveformParams,
    fft: Arc<dyn Fft<f64>>,
    window: Vec<f64>,
    /// Visual bin for each FFT bin below Nyquist; `None` means outside the band.
    bin_map: Vec<Option<usize>>,
}

impl fmt::Debug for WaveformGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaveformGenerator")
            .field("params", &self.params)
            .field(
                "mapped_bins",
                &self.bin_map.iter().filter(|b| b.is_some()).count(),
            )
            .finish()
    }
}

impl WaveformGenerator {
    pub fn new(params: WaveformParams) -> Result<Self> {
        params.validate()?;
        let fft = FftPlanner::<f64>::new().plan_fft_forward(params.frame_size);
        let window = hann_window(params.frame_size);
        let bin_map = build_bin_map(&params);
        Ok(Self {
            params,
            fft,
            window,
            bin_map,
        })
    }

    pub fn params(&self) -> &WaveformParams {
        &self.params
    }

    pub fn generate(&self, samples: &[i16]) -> Vec<WaveformFrame> {
        let frame_size = self.params.frame_size;
        let frames = self.params.frame_count(samples.len());
        let mut out = Vec::with_capacity(frames);

        let mut buffer = vec![Complex::new(0.0, 0.0); frame_size];
        let mut scratch =
            vec![Complex::new(0.0, 0.0); self.fft.get_inplace_scratch_len()];
        let mut binned = vec![0.0f64; self.params.visual_bins];

        for index in 0..frames {
            let start = index * self.params.hop_size;
            let frame = &samples[start..start + frame_size];

            for ((slot, &sample), &w) in
                buffer.iter_mut().zip(frame).zip(&self.window)
            {
                *slot = Complex::new(f64::from(sample) * w, 0.0);
            }
            self.fft.process_with_scratch(&mut buffer, &mut scratch);

            binned.iter_mut().for_each(|v| *v = 0.0);
            for (k, target) in self.bin_map.iter().enumerate() {
                if let Some(bin) = target {
                    binned[*bin] += buffer[k].norm();
                }
            }

            let smoothed = smooth(&binned, &self.params.smoothing_weights);
            out.push(WaveformFrame {
                time: start as f64 / f64::from(self.params.sample_rate_hz),
                frequencies: quantize(
                    &smoothed,
                    self.params.volume_sensitivity,
                ),
            });
        }

        out
    }
}

fn hann_window(size: usize) -> Vec<f64> {
    let denom = (size - 1) as f64;
    (0..size)
        .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f64 / denom).cos())
        .collect()
}

fn build_bin_map(params: &WaveformParams) -> Vec<Option<usize>> {
    let bin_width = f64::from(params.sample_rate_hz) / params.frame_size as f64;
    let band = params.max_frequency_hz - params.min_frequency_hz;
    let bins = params.visual_bins;

    (0..params.frame_size / 2)
        .map(|k| {
            let freq = k as f64 * bin_width;
            if freq < params.min_frequency_hz || freq > params.max_frequency_hz {
                return None;
            }
            let normalized = (freq - params.min_frequency_hz) / band;
            let warped = normalized.powf(1.0 / params.gamma);
            let bin = (warped * bins as f64).floor() as usize;
            Some(bin.min(bins - 1))
        })
        .collect()
}

/// Weighted moving average over neighbouring bins. At the edges the result
/// is divided by the weights that were actually available.
fn smooth(values: &[f64], weights: &[f64; 3]) -> Vec<f64> {
    let len = values.len();
    (0..len)
        .map(|i| {
            let mut acc = 0.0;
            let mut total = 0.0;
            for (w, weight) in weights.iter().enumerate() {
                let Some(j) = (i + w).checked_sub(1) else {
                    continue;
                };
                if j < len {
                    acc += values[j] * weight;
                    total += weight;
                }
            }
            if total > 0.0 { acc / total } else { 0.0 }
        })
        .collect()
}

fn quantize(values: &[f64], sensitivity: f64) -> Vec<u8> {
    let max = values.iter().copied().fold(0.0f64, f64::max);
    if max <= 0.0 || !max.is_finite() {
        return vec![0; values.len()];
    }
    let log_max = (max + 1.0).ln();
    values
        .iter()
        .map(|&v| {
            let scaled = ((v.max(0.0) + 1.0).ln() / log_max).clamp(0.0, 1.0);
            let shaped = scaled.powf(sensitivity);
            (shaped * 255.0).round().min(255.0) as u8
        })
        .collect()
}
