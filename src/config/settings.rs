//! Pipeline settings structs, defaults, validation and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across threads.
//! Every section is `#[serde(default)]`, so a partial `settings.toml` only
//! overrides the keys it names.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::AppPaths;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// A setting combination the pipeline cannot run with.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("channel capacity {0} is not a power of two >= 2")]
    CapacityNotPowerOfTwo(usize),

    #[error("a frame of {frame} samples does not fit a channel of capacity {capacity}")]
    FrameExceedsCapacity { frame: usize, capacity: usize },

    #[error("FFT length {fft} is shorter than the frame size {frame}")]
    FftTooShort { fft: usize, frame: usize },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("smoothing factor {0} must be in (0, 1]")]
    Smoothing(f32),
}

// ---------------------------------------------------------------------------
// DeviceConfig
// ---------------------------------------------------------------------------

/// Which audio endpoints to open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Capture device name, or `"default"` for the host default.
    pub input: String,
    /// Playback device name, or `"default"` for the host default.
    pub output: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            input: "default".into(),
            output: "default".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// AudioConfig
// ---------------------------------------------------------------------------

/// Stream format and buffering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz for both endpoints.
    pub sample_rate: u32,
    /// Microphone count; capture frames are interleaved with this many channels.
    pub input_channels: u16,
    /// Output channel count.  The beamformer emits mono; extra channels
    /// receive copies.
    pub output_channels: u16,
    /// Frames per processing block and per device period.
    pub frame_size: usize,
    /// Capacity of each inter-stage channel in samples (power of two).
    pub channel_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 32_000,
            input_channels: 2,
            output_channels: 1,
            frame_size: 512,
            channel_capacity: 4096,
        }
    }
}

impl AudioConfig {
    /// Wall-clock length of one frame.
    pub fn frame_period(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frame_size as f64 / f64::from(self.sample_rate))
    }
}

// ---------------------------------------------------------------------------
// ArrayConfig
// ---------------------------------------------------------------------------

/// Microphone array geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArrayConfig {
    /// Spacing between adjacent microphones in metres.
    pub mic_distance_m: f32,
    /// Speed of sound in m/s.
    pub sound_speed_mps: f32,
    /// Clamp for steering delays, in samples.
    pub max_steering_delay: usize,
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            mic_distance_m: 0.0585,
            sound_speed_mps: 343.0,
            max_steering_delay: 24,
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessingConfig
// ---------------------------------------------------------------------------

/// How aligned channels are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CombineMode {
    /// Weighted sample-by-sample average.
    #[default]
    TimeDomain,
    /// Per-channel FFT, complex weighting, summed spectrum, inverse FFT.
    FrequencyDomain,
}

/// Which direction-of-arrival estimator to plug in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DoaMethod {
    /// Time difference of arrival from inter-channel cross-correlation.
    #[default]
    CrossCorrelation,
    /// Always report `fixed_angle`.
    Fixed,
}

/// Beamforming engine tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub mode: CombineMode,
    /// Transform length for frequency-domain mode (>= frame size).
    pub fft_size: usize,
    /// Run DOA estimation every this many frames.
    pub doa_interval_frames: u32,
    pub doa_method: DoaMethod,
    /// Angle reported by [`DoaMethod::Fixed`] and the initial steering angle.
    pub fixed_angle: u16,
    /// Low-pass factor applied to new DOA estimates (1.0 = no smoothing).
    pub smoothing: f32,
    /// Smoothed changes smaller than this many degrees are ignored.
    pub hysteresis_deg: u16,
    /// Frequency-domain bins below this frequency are zeroed (0 = off).
    pub low_cut_hz: f32,
    /// Frames whose mean-square energy is below this are skipped by the DOA
    /// estimator.
    pub doa_energy_floor: f32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            mode: CombineMode::default(),
            fft_size: 1024,
            doa_interval_frames: 10,
            doa_method: DoaMethod::default(),
            fixed_angle: 90,
            smoothing: 0.3,
            hysteresis_deg: 2,
            low_cut_hz: 0.0,
            doa_energy_floor: 100.0,
        }
    }
}

// ---------------------------------------------------------------------------
// RecoveryConfig
// ---------------------------------------------------------------------------

/// Fault handling, retry bounds and polling intervals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Consecutive failed recoveries a device stage tolerates before it
    /// waits for an operator restart.
    pub max_xrun_retries: u32,
    pub watchdog_timeout_ms: u64,
    /// Idle back-off while the pipeline is not `Running`.
    pub idle_poll_ms: u64,
    /// Interval between `resume` attempts on a suspended device.
    pub resume_poll_ms: u64,
    pub max_resume_attempts: u32,
    /// Longest a stage waits to push into a full channel before counting the
    /// remainder as dropped.
    pub backpressure_timeout_ms: u64,
    /// Silence periods written to the output device before the first real
    /// period.
    pub prefill_periods: u32,
    /// Consecutive silence periods the output writes while its source is
    /// empty.
    pub max_silence_periods: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_xrun_retries: 5,
            watchdog_timeout_ms: 5_000,
            idle_poll_ms: 100,
            resume_poll_ms: 100,
            max_resume_attempts: 50,
            backpressure_timeout_ms: 200,
            prefill_periods: 2,
            max_silence_periods: 8,
        }
    }
}

impl RecoveryConfig {
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn resume_poll(&self) -> Duration {
        Duration::from_millis(self.resume_poll_ms)
    }

    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// LogConfig
// ---------------------------------------------------------------------------

/// Logging sink settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// When `false` only errors are logged.
    pub enabled: bool,
    /// Entries kept in the in-memory history ring.
    pub history_entries: usize,
    /// Where to dump the history on exit, if anywhere.
    pub dump_path: Option<std::path::PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            history_entries: 1000,
            dump_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// BeamformerConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level configuration, serialised as `settings.toml`.
///
/// ```rust,no_run
/// use mic_beamformer::config::BeamformerConfig;
///
/// // Load (returns Default when the file is missing)
/// let config = BeamformerConfig::load().unwrap();
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BeamformerConfig {
    pub devices: DeviceConfig,
    pub audio: AudioConfig,
    pub array: ArrayConfig,
    pub processing: ProcessingConfig,
    pub recovery: RecoveryConfig,
    pub logging: LogConfig,
}

impl BeamformerConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(BeamformerConfig::default())` when the file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file())
    }

    /// Load from an explicit path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save to the platform-appropriate `settings.toml`, creating parent
    /// directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file())
    }

    /// Save to an explicit path.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check the cross-field constraints the pipeline relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let audio = &self.audio;

        let capacity = audio.channel_capacity;
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(ConfigError::CapacityNotPowerOfTwo(capacity));
        }
        if audio.sample_rate == 0 {
            return Err(ConfigError::Zero("sample_rate"));
        }
        if audio.input_channels == 0 {
            return Err(ConfigError::Zero("input_channels"));
        }
        if audio.output_channels == 0 {
            return Err(ConfigError::Zero("output_channels"));
        }
        if audio.frame_size == 0 {
            return Err(ConfigError::Zero("frame_size"));
        }

        let widest = audio
            .frame_size
            .checked_mul(usize::from(audio.input_channels.max(audio.output_channels)))
            .unwrap_or(usize::MAX);
        if widest > capacity - 1 {
            return Err(ConfigError::FrameExceedsCapacity {
                frame: widest,
                capacity,
            });
        }

        let processing = &self.processing;
        if processing.fft_size < audio.frame_size {
            return Err(ConfigError::FftTooShort {
                fft: processing.fft_size,
                frame: audio.frame_size,
            });
        }
        if processing.doa_interval_frames == 0 {
            return Err(ConfigError::Zero("doa_interval_frames"));
        }
        if !(processing.smoothing > 0.0 && processing.smoothing <= 1.0) {
            return Err(ConfigError::Smoothing(processing.smoothing));
        }

        if !(self.array.mic_distance_m > 0.0) {
            return Err(ConfigError::Zero("mic_distance_m"));
        }
        if !(self.array.sound_speed_mps > 0.0) {
            return Err(ConfigError::Zero("sound_speed_mps"));
        }
        if self.recovery.watchdog_timeout_ms == 0 {
            return Err(ConfigError::Zero("watchdog_timeout_ms"));
        }
        if self.recovery.idle_poll_ms == 0 {
            return Err(ConfigError::Zero("idle_poll_ms"));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
