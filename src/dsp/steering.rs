//! Angle → per-channel sample delay lookup.
//!
//! Angles run from 0° to 180° in 1° steps; 90° is broadside (straight ahead),
//! where every delay is zero.  For a uniform linear array with spacing `d`,
//! microphone `c` hears a wavefront from angle `θ`
//!
//! ```text
//! delay_c(θ) = c · d · sin(θ − 90°) / speed_of_sound · sample_rate
//! ```
//!
//! samples later than microphone 0.  Integer delays are clamped to
//! `[-max_delay, +max_delay]`.

use crate::config::BeamformerConfig;

/// Largest steering angle in degrees.
pub const MAX_ANGLE: u16 = 180;
/// Straight-ahead steering angle.
pub const BROADSIDE: u16 = 90;

const ANGLE_COUNT: usize = MAX_ANGLE as usize + 1;

// ---------------------------------------------------------------------------
// ArrayGeometry
// ---------------------------------------------------------------------------

/// Physical description of the microphone array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArrayGeometry {
    pub mic_distance_m: f32,
    pub sound_speed_mps: f32,
    pub sample_rate: u32,
    pub channels: usize,
    pub max_delay: usize,
}

impl ArrayGeometry {
    pub fn from_config(config: &BeamformerConfig) -> Self {
        Self {
            mic_distance_m: config.array.mic_distance_m,
            sound_speed_mps: config.array.sound_speed_mps,
            sample_rate: config.audio.sample_rate,
            channels: usize::from(config.audio.input_channels),
            max_delay: config.array.max_steering_delay,
        }
    }

    /// Exact (unclamped) delay between adjacent microphones at `angle`.
    fn pair_delay(&self, angle: u16) -> f32 {
        let theta = (f32::from(angle) - f32::from(BROADSIDE)).to_radians();
        self.mic_distance_m * theta.sin() / self.sound_speed_mps * self.sample_rate as f32
    }

    /// Inverse of the steering law: the angle whose adjacent-pair delay is
    /// `lag` samples.
    pub fn angle_for_lag(&self, lag: f32) -> u16 {
        let spread = self.mic_distance_m / self.sound_speed_mps * self.sample_rate as f32;
        if spread <= 0.0 {
            return BROADSIDE;
        }
        let sine = (lag / spread).clamp(-1.0, 1.0);
        let angle = f32::from(BROADSIDE) + sine.asin().to_degrees();
        angle.round().clamp(0.0, f32::from(MAX_ANGLE)) as u16
    }
}

// ---------------------------------------------------------------------------
// SteeringTable
// ---------------------------------------------------------------------------

/// Precomputed steering delays for every angle and channel.
///
/// Immutable after construction.
#[derive(Debug, Clone)]
pub struct SteeringTable {
    channels: usize,
    max_delay: i32,
    delays: Vec<i32>,
    exact: Vec<f32>,
}

impl SteeringTable {
    pub fn new(geometry: &ArrayGeometry) -> Self {
        let channels = geometry.channels.max(1);
        let max_delay = i32::try_from(geometry.max_delay).unwrap_or(i32::MAX);
        let limit = max_delay as f32;

        let mut delays = Vec::with_capacity(ANGLE_COUNT * channels);
        let mut exact = Vec::with_capacity(ANGLE_COUNT * channels);

        for angle in 0..=MAX_ANGLE {
            let pair = geometry.pair_delay(angle);
            for c in 0..channels {
                let d = (c as f32 * pair).clamp(-limit, limit);
                exact.push(d);
                delays.push((d.round() as i32).clamp(-max_delay, max_delay));
            }
        }

        Self {
            channels,
            max_delay,
            delays,
            exact,
        }
    }

    /// Delay of channel 1 relative to channel 0 at `angle` (0 for mono).
    ///
    /// Angles above 180 are treated as 180.
    pub fn delay(&self, angle: u16) -> i32 {
        if self.channels < 2 {
            return 0;
        }
        self.channel_delays(angle)[1]
    }

    /// Integer delay of every channel relative to channel 0.
    pub fn channel_delays(&self, angle: u16) -> &[i32] {
        let start = Self::index(angle) * self.channels;
        &self.delays[start..start + self.channels]
    }

    /// Exact fractional delay of every channel relative to channel 0.
    pub fn fractional_delays(&self, angle: u16) -> &[f32] {
        let start = Self::index(angle) * self.channels;
        &self.exact[start..start + self.channels]
    }

    pub fn max_delay(&self) -> i32 {
        self.max_delay
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    fn index(angle: u16) -> usize {
        usize::from(angle.min(MAX_ANGLE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(channels: usize, max_delay: usize) -> ArrayGeometry {
        ArrayGeometry {
            mic_distance_m: 0.0585,
            sound_speed_mps: 343.0,
            sample_rate: 32_000,
            channels,
            max_delay,
        }
    }

    #[test]
    fn every_entry_is_within_the_clamp() {
        let table = SteeringTable::new(&geometry(4, 24));
        for angle in 0..=MAX_ANGLE {
            for &d in table.channel_delays(angle) {
                assert!((-24..=24).contains(&d), "angle {angle}: {d}");
            }
            assert!((-24..=24).contains(&table.delay(angle)));
        }
    }

    #[test]
    fn broadside_is_zero() {
        let table = SteeringTable::new(&geometry(2, 24));
        assert_eq!(table.delay(BROADSIDE), 0);
        assert!(table.channel_delays(BROADSIDE).iter().all(|&d| d == 0));
    }

    #[test]
    fn endfire_matches_physical_spread() {
        // 0.0585 m / 343 m/s * 32 kHz ≈ 5.46 samples
        let table = SteeringTable::new(&geometry(2, 24));
        assert_eq!(table.delay(180), 5);
        assert_eq!(table.delay(0), -5);
        assert!((table.fractional_delays(180)[1] - 5.458).abs() < 0.01);
    }

    #[test]
    fn small_clamp_saturates() {
        let table = SteeringTable::new(&geometry(2, 2));
        assert_eq!(table.delay(180), 2);
        assert_eq!(table.delay(0), -2);
        assert_eq!(table.max_delay(), 2);
    }

    #[test]
    fn angles_past_180_are_clamped() {
        let table = SteeringTable::new(&geometry(2, 24));
        assert_eq!(table.delay(500), table.delay(180));
    }

    #[test]
    fn mono_array_never_delays() {
        let table = SteeringTable::new(&geometry(1, 24));
        assert_eq!(table.delay(0), 0);
        assert_eq!(table.channel_delays(30), &[0]);
    }

    #[test]
    fn angle_for_lag_inverts_the_table() {
        let geo = geometry(2, 24);
        assert_eq!(geo.angle_for_lag(0.0), 90);
        assert_eq!(geo.angle_for_lag(100.0), 180);
        assert_eq!(geo.angle_for_lag(-100.0), 0);

        let table = SteeringTable::new(&geo);
        for lag in -5..=5 {
            let angle = geo.angle_for_lag(lag as f32);
            assert_eq!(table.delay(angle), lag, "lag {lag} -> angle {angle}");
        }
    }
}
