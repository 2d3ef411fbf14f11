//! Audio plumbing shared by every stage.
//!
//! ```text
//! capture device ─▶ SampleChannel A ─▶ beamforming engine ─▶ SampleChannel B ─▶ output device
//! ```
//!
//! [`SampleChannel`] is the bounded blocking queue on each pipeline edge;
//! [`frame`] holds the interleaving and conversion helpers.

pub mod channel;
pub mod frame;

pub use channel::{SampleChannel, WAIT_SLICE};
pub use frame::{extract_channel, interleave, is_silent, peak, saturate_i16};
