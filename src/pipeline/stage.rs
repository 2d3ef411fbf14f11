//! Lifecycle shared by every pipeline stage.
//!
//! Each stage (capture device, beamforming engine, output device) runs on one
//! dedicated thread.  Cancellation is cooperative: [`Stage::stop`] clears the
//! stage's `running` flag and joins the thread; closing the channels unblocks
//! any thread parked on them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use super::runner::PipelineError;
use super::state::{AppState, StateCell};

/// A pipeline stage with its own worker thread.
pub trait Stage: Send {
    fn name(&self) -> &'static str;

    /// Acquire resources (open devices).  Fatal errors abort pipeline start-up.
    fn init(&mut self) -> Result<(), PipelineError>;

    /// Spawn the worker thread.  Calling it on a started stage is a no-op.
    fn start(&mut self) -> Result<(), PipelineError>;

    /// Stop and join the worker thread.  Idempotent.
    fn stop(&mut self);

    /// The stage's local state.
    fn state(&self) -> AppState;
}

// ---------------------------------------------------------------------------
// StageShared
// ---------------------------------------------------------------------------

/// Flags shared between a stage handle and its worker thread.
#[derive(Debug, Default)]
pub struct StageShared {
    running: AtomicBool,
    state: StateCell,
}

impl StageShared {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// The flag itself, for calls that poll it while blocking.
    pub fn running_flag(&self) -> &AtomicBool {
        &self.running
    }

    pub fn state(&self) -> AppState {
        self.state.get()
    }

    pub fn set_state(&self, state: AppState) {
        self.state.set(state);
    }
}

// ---------------------------------------------------------------------------
// Thread helpers
// ---------------------------------------------------------------------------

pub(crate) fn spawn_stage<T, F>(name: &'static str, body: F) -> Result<JoinHandle<T>, PipelineError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|source| PipelineError::Spawn {
            stage: name,
            source,
        })
}

/// Join a stage thread, logging instead of propagating a panic.
pub(crate) fn join_stage<T>(name: &'static str, handle: JoinHandle<T>) -> Option<T> {
    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            log::error!("{name} thread panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_flags_start_idle() {
        let shared = StageShared::new();
        assert!(!shared.is_running());
        assert_eq!(shared.state(), AppState::Init);

        shared.set_running(true);
        shared.set_state(AppState::Error);
        assert!(shared.running_flag().load(Ordering::Acquire));
        assert_eq!(shared.state(), AppState::Error);
    }

    #[test]
    fn join_returns_the_worker_value() {
        let handle = spawn_stage("stage-test", || 7).unwrap();
        assert_eq!(join_stage("stage-test", handle), Some(7));
    }

    #[test]
    fn join_swallows_a_panic() {
        let handle = spawn_stage("stage-panic", || -> u8 { panic!("boom") }).unwrap();
        assert_eq!(join_stage("stage-panic", handle), None);
    }
}
