//! The xrun-recovery protocol.
//!
//! * Underrun/overrun: re-prepare the stream, then retry the transfer once.
//! * Suspend: poll `resume()` while it answers "try again" (bounded by the
//!   attempt limit and by the stage's running flag); if resume did not
//!   succeed, fall back to `prepare()`; then retry the transfer once.
//! * Anything else is not recoverable locally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use super::driver::{PcmStream, ResumeError, TransferFault};
use crate::config::BeamformerConfig;
use crate::pipeline::FaultKind;

/// Bounds on the suspend branch of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub resume_poll: Duration,
    pub max_resume_attempts: u32,
}

impl RecoveryPolicy {
    pub fn from_config(config: &BeamformerConfig) -> Self {
        Self {
            resume_poll: config.recovery.resume_poll(),
            max_resume_attempts: config.recovery.max_resume_attempts,
        }
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            resume_poll: Duration::from_millis(100),
            max_resume_attempts: 50,
        }
    }
}

/// Local recovery gave up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("{fault} is not recoverable")]
    Unrecoverable { fault: TransferFault },

    #[error("prepare after {fault} failed: {source}")]
    Prepare {
        fault: TransferFault,
        source: TransferFault,
    },

    #[error("retry after {fault} failed: {source}")]
    Retry {
        fault: TransferFault,
        source: TransferFault,
    },
}

impl RecoveryError {
    /// The fault that started the failed recovery.
    pub fn fault(&self) -> &TransferFault {
        match self {
            RecoveryError::Unrecoverable { fault }
            | RecoveryError::Prepare { fault, .. }
            | RecoveryError::Retry { fault, .. } => fault,
        }
    }

    /// How the fault controller should classify this failure.
    pub fn fault_kind(&self) -> FaultKind {
        match self.fault() {
            TransferFault::Suspended => FaultKind::DeviceSuspend,
            TransferFault::Underrun | TransferFault::Overrun => FaultKind::DeviceUnderrunOverrun,
            TransferFault::Other(_) => FaultKind::SystemFault,
        }
    }
}

/// Bring a faulted stream back to a runnable state.
pub fn xrun_recovery<S>(
    stream: &mut S,
    fault: &TransferFault,
    policy: &RecoveryPolicy,
    running: &AtomicBool,
) -> Result<(), RecoveryError>
where
    S: PcmStream + ?Sized,
{
    let prepare = |stream: &mut S| {
        stream.prepare().map_err(|source| RecoveryError::Prepare {
            fault: fault.clone(),
            source,
        })
    };

    match fault {
        TransferFault::Underrun | TransferFault::Overrun => prepare(stream),
        TransferFault::Suspended => {
            let mut attempts = 0;
            loop {
                match stream.resume() {
                    Ok(()) => {
                        log::info!("device resumed after {attempts} retries");
                        return Ok(());
                    }
                    Err(ResumeError::TryAgain) => {
                        attempts += 1;
                        if attempts >= policy.max_resume_attempts
                            || !running.load(Ordering::Acquire)
                        {
                            log::warn!("device still suspended after {attempts} attempts");
                            break;
                        }
                        thread::sleep(policy.resume_poll);
                    }
                    Err(e) => {
                        log::warn!("resume failed ({e}), re-preparing");
                        break;
                    }
                }
            }
            prepare(stream)
        }
        TransferFault::Other(_) => Err(RecoveryError::Unrecoverable {
            fault: fault.clone(),
        }),
    }
}

/// Run `op`; on a fault, recover the stream and retry `op` exactly once.
pub fn transfer_with_recovery<S, T, F>(
    stream: &mut S,
    policy: &RecoveryPolicy,
    running: &AtomicBool,
    mut op: F,
) -> Result<T, RecoveryError>
where
    S: PcmStream + ?Sized,
    F: FnMut(&mut S) -> Result<T, TransferFault>,
{
    match op(stream) {
        Ok(value) => Ok(value),
        Err(fault) => {
            log::warn!("{} stream: {fault}, recovering", stream.params().device);
            xrun_recovery(stream, &fault, policy, running)?;
            op(stream).map_err(|source| RecoveryError::Retry { fault, source })
        }
    }
}
