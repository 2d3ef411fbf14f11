//! Combining time-aligned channels into one output frame.
//!
//! Two strategies, chosen by [`CombineMode`]:
//!
//! * **Time domain**: weighted sum of the aligned channels sample by sample.
//! * **Frequency domain**: each channel is zero-padded to the FFT length and
//!   transformed, multiplied by `(1/M) · e^{-j2πk·r_c/N}` (the phase term
//!   applies the fractional residual delay `r_c` the integer delay lines could
//!   not express), summed, inverse transformed, and scaled by `1/N`.  Bins
//!   below the low-cut frequency are zeroed.
//!
//! All buffers are allocated once; [`Combiner::combine`] does not allocate.

use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use super::ProcessingError;
use crate::audio::saturate_i16;
use crate::config::{BeamformerConfig, CombineMode};

// ---------------------------------------------------------------------------
// Time domain
// ---------------------------------------------------------------------------

/// Weighted delay-and-sum.
#[derive(Debug, Clone)]
pub struct TimeDomainCombiner {
    weights: Vec<f32>,
}

impl TimeDomainCombiner {
    /// Equal weights, `1 / channels` each.
    pub fn new(channels: usize) -> Self {
        let channels = channels.max(1);
        Self {
            weights: vec![1.0 / channels as f32; channels],
        }
    }

    /// Custom weights, normalised to sum to 1.
    pub fn with_weights(weights: &[f32]) -> Self {
        let total: f32 = weights.iter().sum();
        if weights.is_empty() || total.abs() < f32::EPSILON {
            return Self::new(weights.len());
        }
        Self {
            weights: weights.iter().map(|w| w / total).collect(),
        }
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    fn combine(&self, aligned: &[Vec<f32>], out: &mut [i16]) {
        for (i, slot) in out.iter_mut().enumerate() {
            let sum: f32 = aligned
                .iter()
                .zip(self.weights.iter())
                .map(|(channel, w)| channel[i] * w)
                .sum();
            *slot = saturate_i16(sum);
        }
    }
}

// ---------------------------------------------------------------------------
// Frequency domain
// ---------------------------------------------------------------------------

/// FFT-based combination with fractional-delay phase weights.
pub struct FrequencyDomainCombiner {
    fft_len: usize,
    low_cut_bins: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    spectra: Vec<Vec<Complex<f32>>>,
    sum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl FrequencyDomainCombiner {
    pub fn new(channels: usize, fft_len: usize, sample_rate: u32, low_cut_hz: f32) -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(fft_len);
        let inverse = planner.plan_fft_inverse(fft_len);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());

        let low_cut_bins = if low_cut_hz > 0.0 && sample_rate > 0 {
            (low_cut_hz * fft_len as f32 / sample_rate as f32).ceil() as usize
        } else {
            0
        };

        let zero = Complex::new(0.0, 0.0);
        Self {
            fft_len,
            low_cut_bins,
            forward,
            inverse,
            spectra: vec![vec![zero; fft_len]; channels.max(1)],
            sum: vec![zero; fft_len],
            scratch: vec![zero; scratch_len],
        }
    }

    pub fn fft_len(&self) -> usize {
        self.fft_len
    }

    fn combine(
        &mut self,
        aligned: &[Vec<f32>],
        residual: &[f32],
        out: &mut [i16],
    ) -> Result<(), ProcessingError> {
        let n = self.fft_len;
        if out.len() > n {
            return Err(ProcessingError::FrameLength {
                expected: n,
                actual: out.len(),
            });
        }
        let gain = 1.0 / aligned.len().max(1) as f32;

        for (spectrum, channel) in self.spectra.iter_mut().zip(aligned) {
            for (i, bin) in spectrum.iter_mut().enumerate() {
                let x = channel.get(i).copied().unwrap_or(0.0);
                *bin = Complex::new(x, 0.0);
            }
            self.forward.process_with_scratch(spectrum, &mut self.scratch);
        }

        let half = n / 2;
        for (k, acc) in self.sum.iter_mut().enumerate() {
            *acc = Complex::new(0.0, 0.0);
            // signed frequency index keeps the weights Hermitian
            let signed = if k <= half { k as f32 } else { k as f32 - n as f32 };
            if signed.abs() < self.low_cut_bins as f32 {
                continue;
            }
            for (spectrum, &r) in self.spectra.iter().zip(residual) {
                let phase = -2.0 * PI * signed * r / n as f32;
                *acc += spectrum[k] * Complex::from_polar(gain, phase);
            }
        }

        self.inverse.process_with_scratch(&mut self.sum, &mut self.scratch);

        let scale = 1.0 / n as f32;
        for (slot, bin) in out.iter_mut().zip(self.sum.iter()) {
            let value = bin.re * scale;
            if !value.is_finite() {
                return Err(ProcessingError::NonFinite);
            }
            *slot = saturate_i16(value);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Combiner
// ---------------------------------------------------------------------------

/// The configured combination strategy.
pub enum Combiner {
    Time(TimeDomainCombiner),
    Frequency(FrequencyDomainCombiner),
}

impl Combiner {
    pub fn from_config(config: &BeamformerConfig) -> Self {
        let channels = usize::from(config.audio.input_channels);
        match config.processing.mode {
            CombineMode::TimeDomain => Self::Time(TimeDomainCombiner::new(channels)),
            CombineMode::FrequencyDomain => Self::Frequency(FrequencyDomainCombiner::new(
                channels,
                config.processing.fft_size,
                config.audio.sample_rate,
                config.processing.low_cut_hz,
            )),
        }
    }

    pub fn mode(&self) -> CombineMode {
        match self {
            Self::Time(_) => CombineMode::TimeDomain,
            Self::Frequency(_) => CombineMode::FrequencyDomain,
        }
    }

    /// Combine `aligned` channels into `out`.
    ///
    /// Each aligned channel must hold at least `out.len()` samples and
    /// `residual` must have one entry per channel.
    pub fn combine(
        &mut self,
        aligned: &[Vec<f32>],
        residual: &[f32],
        out: &mut [i16],
    ) -> Result<(), ProcessingError> {
        if residual.len() != aligned.len() {
            return Err(ProcessingError::ChannelCount {
                expected: aligned.len(),
                actual: residual.len(),
            });
        }
        if let Some(short) = aligned.iter().find(|c| c.len() < out.len()) {
            return Err(ProcessingError::FrameLength {
                expected: out.len(),
                actual: short.len(),
            });
        }
        match self {
            Self::Time(time) => {
                time.combine(aligned, out);
                Ok(())
            }
            Self::Frequency(freq) => freq.combine(aligned, residual, out),
        }
    }
}
