//! Audio device endpoints.
//!
//! ```text
//! PcmDriver ──open──▶ CaptureStream  ──▶ CaptureEndpoint ─┐
//!                                                         ├─ RecoverableDevice<E> (one thread each)
//! PcmDriver ──open──▶ PlaybackStream ──▶ OutputEndpoint  ─┘
//! ```
//!
//! [`driver`] defines the backend boundary; [`CpalDriver`] talks to real
//! hardware and [`SimulatedDriver`] is a scripted stand-in.  [`recovery`]
//! holds the xrun-recovery protocol shared by both endpoints.

pub mod capture;
pub mod cpal_backend;
pub mod driver;
pub mod endpoint;
pub mod output;
pub mod recovery;
pub mod simulated;

pub use capture::CaptureEndpoint;
pub use cpal_backend::CpalDriver;
pub use driver::{
    CaptureStream, DeviceError, Direction, PcmDriver, PcmStream, PlaybackStream, ResumeError,
    StreamParams, TransferFault,
};
pub use endpoint::{Endpoint, RecoverableDevice, Step};
pub use output::OutputEndpoint;
pub use recovery::{transfer_with_recovery, xrun_recovery, RecoveryError, RecoveryPolicy};
pub use simulated::{SimulatedDriver, ToneSpec};
