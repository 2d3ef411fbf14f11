//! Real-time microphone-array beamformer.
//!
//! Captures interleaved multi-channel audio, estimates the direction of
//! arrival, time-aligns the channels toward it and plays back a single
//! combined channel.  Device faults are recovered locally where possible;
//! everything else is reported to a shared fault controller guarded by a
//! watchdog.

pub mod audio;
pub mod config;
pub mod device;
pub mod dsp;
pub mod logging;
pub mod pipeline;
