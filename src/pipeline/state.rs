//! Pipeline state machine vocabulary.
//!
//! [`AppState`] is the process-wide state every stage gates on.  [`FaultKind`]
//! classifies what went wrong.  [`StateCell`] stores an [`AppState`] in a
//! single atomic so stage-local state can be read from any thread without a
//! lock.

use std::sync::atomic::{AtomicU8, Ordering};

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// States of the processing pipeline.
///
/// ```text
/// Init ──init ok──▶ Running ──fault──▶ Error ──▶ Recovery ──ok──▶ Running
///                                                          ──fail─▶ Error
/// any state ──shutdown──▶ Terminating   (absorbing)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum AppState {
    /// Components are being created; no audio flows yet.
    #[default]
    Init = 0,

    /// Normal operation.
    Running = 1,

    /// A fault was reported and has not (yet) been recovered.
    Error = 2,

    /// The fault controller is attempting recovery.
    Recovery = 3,

    /// Deliberate shutdown.  Never exited.
    Terminating = 4,
}

impl AppState {
    /// Returns `true` for the states in which stages must not move audio.
    ///
    /// ```
    /// use mic_beamformer::pipeline::AppState;
    ///
    /// assert!(!AppState::Init.is_blocking());
    /// assert!(!AppState::Running.is_blocking());
    /// assert!(AppState::Error.is_blocking());
    /// assert!(AppState::Recovery.is_blocking());
    /// assert!(AppState::Terminating.is_blocking());
    /// ```
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            AppState::Error | AppState::Recovery | AppState::Terminating
        )
    }

    /// A short label for log lines.
    pub fn label(self) -> &'static str {
        match self {
            AppState::Init => "Init",
            AppState::Running => "Running",
            AppState::Error => "Error",
            AppState::Recovery => "Recovery",
            AppState::Terminating => "Terminating",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => AppState::Init,
            1 => AppState::Running,
            2 => AppState::Error,
            3 => AppState::Recovery,
            _ => AppState::Terminating,
        }
    }
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// FaultKind
// ---------------------------------------------------------------------------

/// Classification of a reported fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FaultKind {
    /// Nothing has gone wrong yet (or an operator restart cleared it).
    #[default]
    None,
    /// Buffer underrun or overrun at the hardware boundary.
    DeviceUnderrunOverrun,
    /// The device was suspended (power management, hot-unplug).
    DeviceSuspend,
    /// The beamforming loop failed on a frame.
    ProcessingFault,
    /// Anything else, including watchdog-detected stalls.
    SystemFault,
}

impl FaultKind {
    /// All reportable kinds, in counter order.
    pub const REPORTABLE: [FaultKind; 4] = [
        FaultKind::DeviceUnderrunOverrun,
        FaultKind::DeviceSuspend,
        FaultKind::ProcessingFault,
        FaultKind::SystemFault,
    ];

    /// Device-level faults are retried by the device stage itself, so the
    /// fault controller treats them as recovered.
    pub fn is_auto_recoverable(self) -> bool {
        matches!(
            self,
            FaultKind::DeviceUnderrunOverrun | FaultKind::DeviceSuspend
        )
    }

    /// Human-readable prefix used when logging a report.
    pub fn label(self) -> &'static str {
        match self {
            FaultKind::None => "no error",
            FaultKind::DeviceUnderrunOverrun => "device xrun",
            FaultKind::DeviceSuspend => "device suspend",
            FaultKind::ProcessingFault => "processing error",
            FaultKind::SystemFault => "system error",
        }
    }

    pub(crate) fn counter_index(self) -> Option<usize> {
        FaultKind::REPORTABLE.iter().position(|k| *k == self)
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// StateCell
// ---------------------------------------------------------------------------

/// Lock-free holder for an [`AppState`].
///
/// Used for each stage's local state.  Reads and writes are single atomic
/// operations, so a reader never observes a torn value.
#[derive(Debug, Default)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// A cell holding `state`.
    pub fn new(state: AppState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Read the current value (acquire).
    pub fn get(&self) -> AppState {
        AppState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Replace the value (release).
    pub fn set(&self, state: AppState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
