//! Streaming feature front end: raw PCM in, transformed feature frames out.
//!
//! Audio is ingested incrementally; log-mel frames are computed as soon as
//! enough samples are buffered, then passed through the bundle's transform
//! chain (global CMVN, splicing + LDA, fMLLR). Consumed samples are never
//! re-windowed: each feature frame is computed exactly once.

use crate::error::ModelError;
use crate::model::FeatureTransforms;
use ndarray::{Array1, Array2};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::Deserialize;
use std::f32::consts::PI;
use std::sync::Arc;

/// Frame geometry and mel parameters, loaded from the bundle's
/// `model.json`.
#[derive(Clone, Debug, Deserialize)]
pub struct FeatureConfig {
    /// Expected input sample rate in Hz
    pub sample_rate: u32,
    /// Analysis window length in samples
    pub frame_length: usize,
    /// Frame shift in samples
    pub frame_shift: usize,
    /// Number of mel filterbank bins (the base feature dimension)
    pub num_mel_bins: usize,
    /// Preemphasis coefficient
    #[serde(default = "default_preemphasis")]
    pub preemphasis: f32,
}

fn default_preemphasis() -> f32 {
    0.97
}

impl FeatureConfig {
    /// Frame shift in seconds.
    pub fn frame_shift_secs(&self) -> f32 {
        self.frame_shift as f32 / self.sample_rate as f32
    }

    pub(crate) fn check(&self) -> Result<(), ModelError> {
        if self.frame_shift == 0 || self.frame_length < self.frame_shift {
            return Err(ModelError::DimensionMismatch {
                what: "frame geometry (frame_length must be >= frame_shift > 0)",
                expected: self.frame_shift.max(1),
                got: self.frame_length,
            });
        }
        Ok(())
    }
}

/// Incremental feature extractor owned by one session.
pub struct FeaturePipeline {
    config: FeatureConfig,
    transforms: Arc<FeatureTransforms>,
    fft: Arc<dyn Fft<f32>>,
    n_fft: usize,
    window: Vec<f32>,
    mel_banks: Array2<f32>,

    /// Raw samples not yet fully windowed; `buf_start` is the absolute
    /// index of `buf[0]`.
    buf: Vec<f32>,
    buf_start: usize,
    samples_accepted: u64,

    /// Base log-mel (+ CMVN) frames, computed eagerly.
    base: Vec<Array1<f32>>,
    /// Final transformed frames, computed on demand.
    out: Vec<Vec<f32>>,
    input_finished: bool,
}

impl FeaturePipeline {
    pub fn new(config: FeatureConfig, transforms: Arc<FeatureTransforms>) -> Self {
        let n_fft = config.frame_length.next_power_of_two();
        let fft = FftPlanner::new().plan_fft_forward(n_fft);
        let window = hann_window(config.frame_length);
        let mel_banks = mel_filterbank(n_fft, config.num_mel_bins, config.sample_rate as usize);

        Self {
            config,
            transforms,
            fft,
            n_fft,
            window,
            mel_banks,
            buf: Vec::new(),
            buf_start: 0,
            samples_accepted: 0,
            base: Vec::new(),
            out: Vec::new(),
            input_finished: false,
        }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    /// Final feature dimension after the transform chain.
    pub fn output_dim(&self) -> usize {
        self.transforms.output_dim(self.config.num_mel_bins)
    }

    /// Append raw waveform samples and compute any frames they complete.
    pub fn accept_waveform(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        self.samples_accepted += samples.len() as u64;
        self.buf.extend_from_slice(samples);
        self.compute_ready_base_frames();
    }

    /// Signal that no more audio will arrive. A trailing partial window of
    /// at least half a frame shift is zero-padded into a final frame, and
    /// splice look-ahead is released.
    pub fn input_finished(&mut self) {
        if self.input_finished {
            return;
        }
        self.input_finished = true;

        let next_start = self.base.len() * self.config.frame_shift;
        let lo = next_start - self.buf_start;
        let remaining = self.buf.len().saturating_sub(lo);
        if remaining > 0 && remaining >= self.config.frame_shift / 2 {
            let mut tail = self.buf[lo..].to_vec();
            tail.resize(self.config.frame_length, 0.0);
            let frame = self.base_frame(&tail);
            self.base.push(frame);
        }
        self.buf.clear();
        self.buf_start = next_start + remaining;

        tracing::debug!(frames = self.base.len(), "feature input finished");
    }

    /// Number of feature frames that can currently be consumed.
    ///
    /// While input is still arriving, the splice right-context is held back
    /// as look-ahead; `input_finished` releases it.
    pub fn num_frames_ready(&self) -> usize {
        if self.input_finished {
            self.base.len()
        } else {
            self.base.len().saturating_sub(self.transforms.right_context())
        }
    }

    /// Transformed feature frame `t`. Must satisfy `t < num_frames_ready()`.
    pub fn frame(&mut self, t: usize) -> &[f32] {
        debug_assert!(t < self.num_frames_ready());
        while self.out.len() <= t {
            let next = self.out.len();
            let frame = self.transforms.apply(&self.base, next);
            self.out.push(frame.to_vec());
        }
        &self.out[t]
    }

    pub fn samples_accepted(&self) -> u64 {
        self.samples_accepted
    }

    pub fn is_input_finished(&self) -> bool {
        self.input_finished
    }

    fn compute_ready_base_frames(&mut self) {
        let shift = self.config.frame_shift;
        let len = self.config.frame_length;

        loop {
            let next_start = self.base.len() * shift;
            if next_start < self.buf_start || next_start + len > self.buf_start + self.buf.len() {
                break;
            }
            let lo = next_start - self.buf_start;
            let samples: Vec<f32> = self.buf[lo..lo + len].to_vec();
            let frame = self.base_frame(&samples);
            self.base.push(frame);
        }

        // drop samples that no future window can touch
        let keep_from = self.base.len() * shift;
        if keep_from > self.buf_start + 4096 {
            let drop = keep_from - self.buf_start;
            self.buf.drain(..drop);
            self.buf_start = keep_from;
        }
    }

    /// One windowed frame of samples -> log-mel (+ CMVN) feature vector.
    fn base_frame(&self, samples: &[f32]) -> Array1<f32> {
        let mut frame: Vec<Complex<f32>> = vec![Complex::new(0.0, 0.0); self.n_fft];

        // preemphasis + Hann window
        frame[0] = Complex::new(samples[0] * self.window[0], 0.0);
        for i in 1..samples.len() {
            let x = samples[i] - self.config.preemphasis * samples[i - 1];
            frame[i] = Complex::new(x * self.window[i], 0.0);
        }

        self.fft.process(&mut frame);

        let freq_bins = self.n_fft / 2 + 1;
        let mut power = Array1::<f32>::zeros(freq_bins);
        for k in 0..freq_bins {
            let magnitude = frame[k].norm();
            power[k] = magnitude * magnitude;
        }

        let mel = self.mel_banks.dot(&power);
        let mut feats = mel.mapv(|x| x.max(1e-10).ln());

        if let Some((mean, inv_std)) = self.transforms.cmvn() {
            feats = (&feats - mean) * inv_std;
        }

        feats
    }
}

/// Create a Hann window.
fn hann_window(window_length: usize) -> Vec<f32> {
    (0..window_length)
        .map(|i| 0.5 - 0.5 * ((2.0 * PI * i as f32) / (window_length as f32 - 1.0)).cos())
        .collect()
}

/// Convert frequency in Hz to mel scale.
fn hz_to_mel(freq: f32) -> f32 {
    2595.0 * (1.0 + freq / 700.0).log10()
}

/// Convert mel scale to frequency in Hz.
fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0)
}

/// Triangular mel filterbank over the FFT power bins.
fn mel_filterbank(n_fft: usize, n_mels: usize, sample_rate: usize) -> Array2<f32> {
    let freq_bins = n_fft / 2 + 1;
    let mut filterbank = Array2::<f32>::zeros((n_mels, freq_bins));

    let min_mel = hz_to_mel(0.0);
    let max_mel = hz_to_mel(sample_rate as f32 / 2.0);

    let mel_points: Vec<f32> = (0..=n_mels + 1)
        .map(|i| mel_to_hz(min_mel + (max_mel - min_mel) * i as f32 / (n_mels + 1) as f32))
        .collect();

    let freq_bin_width = sample_rate as f32 / n_fft as f32;

    for mel_idx in 0..n_mels {
        let left = mel_points[mel_idx];
        let center = mel_points[mel_idx + 1];
        let right = mel_points[mel_idx + 2];

        for freq_idx in 0..freq_bins {
            let freq = freq_idx as f32 * freq_bin_width;

            if freq >= left && freq <= center {
                filterbank[[mel_idx, freq_idx]] = (freq - left) / (center - left);
            } else if freq > center && freq <= right {
                filterbank[[mel_idx, freq_idx]] = (right - freq) / (right - center);
            }
        }
    }

    filterbank
}
