//! The driver boundary: what the pipeline needs from a PCM backend.
//!
//! A [`PcmDriver`] opens blocking capture and playback streams.  Transfers
//! move whole frames of interleaved `i16` samples and fail with a
//! [`TransferFault`]; once a stream has faulted it keeps failing until
//! [`PcmStream::prepare`] (or a successful [`PcmStream::resume`] after a
//! suspend) puts it back into a runnable state.  Dropping a stream closes it.

use thiserror::Error;

use crate::config::BeamformerConfig;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Stream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Capture,
    Playback,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Capture => f.write_str("capture"),
            Direction::Playback => f.write_str("playback"),
        }
    }
}

/// What to open and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    /// Backend device identifier; `"default"` picks the system default.
    pub device: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames per transfer.
    pub period_frames: usize,
}

impl StreamParams {
    pub fn capture(config: &BeamformerConfig) -> Self {
        Self {
            device: config.devices.input.clone(),
            sample_rate: config.audio.sample_rate,
            channels: config.audio.input_channels,
            period_frames: config.audio.frame_size,
        }
    }

    pub fn playback(config: &BeamformerConfig) -> Self {
        Self {
            device: config.devices.output.clone(),
            sample_rate: config.audio.sample_rate,
            channels: config.audio.output_channels,
            period_frames: config.audio.frame_size,
        }
    }

    /// Interleaved samples in one period.
    pub fn period_samples(&self) -> usize {
        self.period_frames * usize::from(self.channels)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Runtime fault codes returned by a transfer or a recovery call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferFault {
    #[error("buffer underrun")]
    Underrun,

    #[error("buffer overrun")]
    Overrun,

    #[error("device suspended")]
    Suspended,

    #[error("device fault: {0}")]
    Other(String),
}

impl TransferFault {
    /// Underrun, overrun and suspend can be handled by the recovery protocol.
    pub fn is_xrun_or_suspend(&self) -> bool {
        !matches!(self, TransferFault::Other(_))
    }
}

/// Result of asking a suspended stream to resume.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResumeError {
    /// The device is still waking up; poll again.
    #[error("device still suspended, try again")]
    TryAgain,

    #[error("resume not supported by this device")]
    Unsupported,

    #[error("resume failed: {0}")]
    Failed(String),
}

/// Open/configure failures.  Fatal to pipeline initialisation.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{direction} device '{device}' not found")]
    NotFound { direction: Direction, device: String },

    #[error("{direction} device '{device}' rejected the configuration: {reason}")]
    Configure {
        direction: Direction,
        device: String,
        reason: String,
    },

    #[error("audio backend error: {0}")]
    Backend(String),

    #[error("failed to spawn stream thread: {0}")]
    Thread(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Operations shared by capture and playback streams.
pub trait PcmStream: Send {
    fn params(&self) -> &StreamParams;

    /// Reset the stream to a runnable state, discarding queued samples.
    fn prepare(&mut self) -> Result<(), TransferFault>;

    /// Resume after a suspend.
    fn resume(&mut self) -> Result<(), ResumeError>;

    /// Block until queued playback has been played.  No-op for capture.
    fn drain(&mut self) -> Result<(), TransferFault>;
}

/// A stream that produces audio.
pub trait CaptureStream: PcmStream {
    /// Fill `buf` (a whole number of interleaved frames) and return the
    /// number of frames read.
    fn read_frames(&mut self, buf: &mut [i16]) -> Result<usize, TransferFault>;
}

/// A stream that consumes audio.
pub trait PlaybackStream: PcmStream {
    /// Queue `buf` (a whole number of interleaved frames) and return the
    /// number of frames accepted.
    fn write_frames(&mut self, buf: &[i16]) -> Result<usize, TransferFault>;
}

/// A PCM backend.
pub trait PcmDriver: Send + Sync {
    fn name(&self) -> &'static str;

    fn open_capture(&self, params: &StreamParams) -> Result<Box<dyn CaptureStream>, DeviceError>;

    fn open_playback(&self, params: &StreamParams)
        -> Result<Box<dyn PlaybackStream>, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_follow_config() {
        let config = BeamformerConfig::default();
        let capture = StreamParams::capture(&config);
        assert_eq!(capture.channels, 2);
        assert_eq!(capture.period_samples(), 1024);

        let playback = StreamParams::playback(&config);
        assert_eq!(playback.channels, 1);
        assert_eq!(playback.period_samples(), 512);
        assert_eq!(playback.device, "default");
    }

    #[test]
    fn only_other_is_outside_the_recovery_protocol() {
        assert!(TransferFault::Underrun.is_xrun_or_suspend());
        assert!(TransferFault::Overrun.is_xrun_or_suspend());
        assert!(TransferFault::Suspended.is_xrun_or_suspend());
        assert!(!TransferFault::Other("io".into()).is_xrun_or_suspend());
    }

    #[test]
    fn error_messages() {
        let err = DeviceError::NotFound {
            direction: Direction::Capture,
            device: "hw:9".into(),
        };
        assert_eq!(err.to_string(), "capture device 'hw:9' not found");
        assert_eq!(TransferFault::Underrun.to_string(), "buffer underrun");
    }
}
