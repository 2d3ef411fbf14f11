//! Direction-of-arrival estimation and steering smoothing.
//!
//! [`DoaEstimator`] is the pluggable seam: the engine asks it for an angle
//! every few frames and feeds accepted values through a [`SteeringSmoother`]
//! before they reach the shared steering angle.

use super::steering::{ArrayGeometry, MAX_ANGLE};
use crate::audio::extract_channel;

/// Produces a steering angle (0..=180) from one interleaved frame.
///
/// `None` means "no confident estimate"; the engine keeps the current angle.
pub trait DoaEstimator: Send {
    fn estimate(&mut self, frame: &[i16], channels: usize) -> Option<u16>;

    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// FixedDoa
// ---------------------------------------------------------------------------

/// Always reports the same angle.
#[derive(Debug, Clone, Copy)]
pub struct FixedDoa {
    angle: u16,
}

impl FixedDoa {
    pub fn new(angle: u16) -> Self {
        Self {
            angle: angle.min(MAX_ANGLE),
        }
    }
}

impl DoaEstimator for FixedDoa {
    fn estimate(&mut self, _frame: &[i16], _channels: usize) -> Option<u16> {
        Some(self.angle)
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

// ---------------------------------------------------------------------------
// CrossCorrelationDoa
// ---------------------------------------------------------------------------

/// Integer-lag cross-correlation between channels 0 and 1.
///
/// The lag maximising `Σ x1[n] · x0[n - lag]` (normalised by overlap) is the
/// delay of channel 1 behind channel 0, and maps back to an angle through the
/// array geometry.
pub struct CrossCorrelationDoa {
    geometry: ArrayGeometry,
    max_lag: usize,
    energy_floor: f32,
    ch0: Vec<f32>,
    ch1: Vec<f32>,
}

impl CrossCorrelationDoa {
    /// `energy_floor` is the mean-square level below which no estimate is made.
    pub fn new(geometry: ArrayGeometry, energy_floor: f32) -> Self {
        Self {
            max_lag: geometry.max_delay,
            geometry,
            energy_floor,
            ch0: Vec::new(),
            ch1: Vec::new(),
        }
    }

    fn best_lag(&self) -> i32 {
        let n = self.ch0.len();
        let max_lag = self.max_lag.min(n.saturating_sub(1)) as i32;
        let mut best = (0_i32, f32::NEG_INFINITY);

        for lag in -max_lag..=max_lag {
            let (start, end) = if lag >= 0 {
                (lag as usize, n)
            } else {
                (0, n - lag.unsigned_abs() as usize)
            };
            let mut acc = 0.0_f32;
            for i in start..end {
                acc += self.ch1[i] * self.ch0[(i as i32 - lag) as usize];
            }
            let score = acc / (end - start).max(1) as f32;
            if score > best.1 || (score == best.1 && lag.abs() < best.0.abs()) {
                best = (lag, score);
            }
        }
        best.0
    }
}

impl DoaEstimator for CrossCorrelationDoa {
    fn estimate(&mut self, frame: &[i16], channels: usize) -> Option<u16> {
        if channels < 2 {
            return None;
        }
        let n = frame.len() / channels;
        if n == 0 {
            return None;
        }
        self.ch0.resize(n, 0.0);
        self.ch1.resize(n, 0.0);
        extract_channel(frame, channels, 0, &mut self.ch0);
        extract_channel(frame, channels, 1, &mut self.ch1);

        let energy = self
            .ch0
            .iter()
            .chain(self.ch1.iter())
            .map(|x| x * x)
            .sum::<f32>()
            / (2 * n) as f32;
        if energy < self.energy_floor {
            return None;
        }

        let lag = self.best_lag();
        Some(self.geometry.angle_for_lag(lag as f32))
    }

    fn name(&self) -> &'static str {
        "cross-correlation"
    }
}

// ---------------------------------------------------------------------------
// SteeringSmoother
// ---------------------------------------------------------------------------

/// Exponential low-pass followed by hysteresis on steering updates.
#[derive(Debug, Clone)]
pub struct SteeringSmoother {
    alpha: f32,
    hysteresis: f32,
    level: Option<f32>,
}

impl SteeringSmoother {
    /// `alpha` in (0, 1]; `hysteresis_deg` is the smallest accepted change.
    pub fn new(alpha: f32, hysteresis_deg: f32) -> Self {
        Self {
            alpha: alpha.clamp(f32::EPSILON, 1.0),
            hysteresis: hysteresis_deg.max(0.0),
            level: None,
        }
    }

    /// Feed one estimate; returns the new angle when it should replace
    /// `current`.
    pub fn update(&mut self, estimate: u16, current: u16) -> Option<u16> {
        let estimate = f32::from(estimate.min(MAX_ANGLE));
        let level = self.level.unwrap_or_else(|| f32::from(current));
        let level = level + self.alpha * (estimate - level);
        self.level = Some(level);

        let candidate = level.round().clamp(0.0, f32::from(MAX_ANGLE)) as u16;
        let change = (f32::from(candidate) - f32::from(current)).abs();
        (candidate != current && change >= self.hysteresis).then_some(candidate)
    }

    pub fn reset(&mut self) {
        self.level = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::interleave;
    use crate::dsp::SteeringTable;

    fn geometry() -> ArrayGeometry {
        ArrayGeometry {
            mic_distance_m: 0.0585,
            sound_speed_mps: 343.0,
            sample_rate: 32_000,
            channels: 2,
            max_delay: 24,
        }
    }

    /// Deterministic broadband noise.
    fn noise(len: usize, seed: u32) -> Vec<i16> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                ((state >> 16) as i16) / 4
            })
            .collect()
    }

    /// Channel 1 lags channel 0 by `lag` samples.
    fn delayed_pair(lag: i32) -> Vec<i16> {
        let n = 512;
        let pad = 32;
        let src = noise(n + 2 * pad, 7);
        let ch0: Vec<i16> = src[pad..pad + n].to_vec();
        let start = (pad as i32 - lag) as usize;
        let ch1: Vec<i16> = src[start..start + n].to_vec();
        interleave(&[ch0, ch1])
    }

    #[test]
    fn fixed_reports_constant() {
        let mut doa = FixedDoa::new(120);
        assert_eq!(doa.estimate(&[], 2), Some(120));
        assert_eq!(FixedDoa::new(400).estimate(&[], 2), Some(180));
    }

    #[test]
    fn cross_correlation_recovers_delay() {
        let table = SteeringTable::new(&geometry());
        let mut doa = CrossCorrelationDoa::new(geometry(), 100.0);
        for lag in [-4, -2, 0, 3, 5] {
            let angle = doa
                .estimate(&delayed_pair(lag), 2)
                .expect("loud frame yields an estimate");
            assert_eq!(table.delay(angle), lag, "lag {lag} -> {angle}");
        }
    }

    #[test]
    fn broadside_for_identical_channels() {
        let mut doa = CrossCorrelationDoa::new(geometry(), 100.0);
        assert_eq!(doa.estimate(&delayed_pair(0), 2), Some(90));
    }

    #[test]
    fn silence_and_mono_give_no_estimate() {
        let mut doa = CrossCorrelationDoa::new(geometry(), 100.0);
        assert_eq!(doa.estimate(&vec![0; 1024], 2), None);
        assert_eq!(doa.estimate(&noise(512, 3), 1), None);
        assert_eq!(doa.estimate(&[], 2), None);
    }

    #[test]
    fn smoother_passthrough() {
        let mut s = SteeringSmoother::new(1.0, 0.0);
        assert_eq!(s.update(120, 90), Some(120));
        assert_eq!(s.update(120, 120), None);
        assert_eq!(s.update(60, 120), Some(60));
    }

    #[test]
    fn smoother_ignores_jitter_and_converges() {
        let mut s = SteeringSmoother::new(0.5, 5.0);
        assert_eq!(s.update(92, 90), None);

        let mut s = SteeringSmoother::new(0.5, 2.0);
        let mut current = 90;
        for _ in 0..20 {
            if let Some(next) = s.update(150, current) {
                assert!(next > current);
                current = next;
            }
        }
        assert!((148..=150).contains(&current), "{current}");
    }
}
