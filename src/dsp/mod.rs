//! Signal processing building blocks for the beamforming engine.
//!
//! - [`steering`]: angle → per-channel delay table
//! - [`delay`]: delay lines and per-frame delay compensation
//! - [`doa`]: direction-of-arrival estimators and steering smoothing
//! - [`combine`]: time-domain and FFT-based channel combination

pub mod combine;
pub mod delay;
pub mod doa;
pub mod steering;

pub use combine::{Combiner, FrequencyDomainCombiner, TimeDomainCombiner};
pub use delay::{DelayCompensator, DelayLine};
pub use doa::{CrossCorrelationDoa, DoaEstimator, FixedDoa, SteeringSmoother};
pub use steering::{ArrayGeometry, SteeringTable, BROADSIDE, MAX_ANGLE};

use thiserror::Error;

/// A fault raised while processing one frame.
///
/// The engine reports any of these as a processing fault and stops
/// consuming input until the pipeline is restarted.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("frame length mismatch: expected {expected} samples, got {actual}")]
    FrameLength { expected: usize, actual: usize },

    #[error("channel count mismatch: expected {expected}, got {actual}")]
    ChannelCount { expected: usize, actual: usize },

    #[error("non-finite sample in combined output")]
    NonFinite,

    #[error("frame processing panicked: {0}")]
    Panicked(String),
}
