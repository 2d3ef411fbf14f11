//! Process-wide fault classification, recovery and liveness monitoring.
//!
//! [`FaultController`] owns the `(global state, last error)` pair.  Every
//! mutation happens under one mutex so that "classify → transition → attempt
//! recovery → transition again" is atomic with respect to other reporters.
//!
//! Stages never spin on the global state: [`FaultController::idle`] parks the
//! caller on a condition variable that is signalled on every transition, with
//! a bounded timeout so shutdown is always observed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::state::{AppState, FaultKind};
use super::watchdog::WatchdogHandle;

/// Number of transitions kept for [`FaultController::transitions`].
const HISTORY_LEN: usize = 64;

// ---------------------------------------------------------------------------
// FaultState
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FaultState {
    global: AppState,
    last_error: FaultKind,
    history: VecDeque<AppState>,
    counts: [u64; FaultKind::REPORTABLE.len()],
}

// ---------------------------------------------------------------------------
// FaultController
// ---------------------------------------------------------------------------

/// Shared fault state machine plus watchdog.
///
/// Construct it once per pipeline and share it as `Arc<FaultController>`.
///
/// ```
/// use mic_beamformer::pipeline::{AppState, FaultController, FaultKind};
/// use std::time::Duration;
///
/// let faults = FaultController::new(Duration::from_secs(5));
/// faults.mark_running();
///
/// faults.report_error(FaultKind::DeviceUnderrunOverrun, "simulated underrun");
/// assert_eq!(faults.state(), AppState::Running);
///
/// faults.report_error(FaultKind::ProcessingFault, "bad frame");
/// assert_eq!(faults.state(), AppState::Error);
/// ```
pub struct FaultController {
    inner: Mutex<FaultState>,
    changed: Condvar,
    epoch: AtomicU64,
    ping: AtomicBool,
    stalled: AtomicBool,
    watchdog_timeout: Duration,
    watchdog: Mutex<Option<WatchdogHandle>>,
}

impl FaultController {
    /// Create a controller in `Init` / `None`.
    pub fn new(watchdog_timeout: Duration) -> Self {
        let mut history = VecDeque::with_capacity(HISTORY_LEN);
        history.push_back(AppState::Init);

        Self {
            inner: Mutex::new(FaultState {
                global: AppState::Init,
                last_error: FaultKind::None,
                history,
                counts: [0; FaultKind::REPORTABLE.len()],
            }),
            changed: Condvar::new(),
            epoch: AtomicU64::new(0),
            ping: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            watchdog_timeout,
            watchdog: Mutex::new(None),
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Current global state.
    pub fn state(&self) -> AppState {
        self.lock().global
    }

    /// The fault that put the pipeline in its current `Error` (or last
    /// recovered from); `None` after a restart.
    pub fn last_error(&self) -> FaultKind {
        self.lock().last_error
    }

    /// Recent global-state transitions, oldest first, starting with `Init`.
    pub fn transitions(&self) -> Vec<AppState> {
        self.lock().history.iter().copied().collect()
    }

    /// How many faults of `kind` have been reported since construction.
    pub fn fault_count(&self, kind: FaultKind) -> u64 {
        kind.counter_index()
            .map(|i| self.lock().counts[i])
            .unwrap_or(0)
    }

    /// Incremented by every operator [`restart`](Self::restart).
    ///
    /// Stages remember the epoch at which they faulted and re-arm once it
    /// changes.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// `Init → Running` after every component initialised.
    ///
    /// Returns `false` when the controller was not in `Init`.
    pub fn mark_running(&self) -> bool {
        let mut st = self.lock();
        if st.global != AppState::Init {
            return false;
        }
        self.transition(&mut st, AppState::Running);
        true
    }

    /// Classify and log a fault, move to `Error`, then try to recover.
    ///
    /// Returns the global state after the attempt.  Reports made while
    /// `Terminating` are logged and otherwise ignored.  While the pipeline
    /// waits in `Error` for a restart, further reports are counted but leave
    /// the state and `last_error` untouched.
    pub fn report_error(&self, kind: FaultKind, details: &str) -> AppState {
        let mut st = self.lock();

        if st.global == AppState::Terminating {
            log::warn!("{kind} during shutdown ignored: {details}");
            return st.global;
        }

        if let Some(i) = kind.counter_index() {
            st.counts[i] += 1;
        }
        log::error!("{kind}: {details}");

        // a fault that needs a restart is not cleared by a later device fault
        if st.global == AppState::Error && !st.last_error.is_auto_recoverable() {
            log::warn!("{kind} while waiting for restart after {}", st.last_error);
            return st.global;
        }

        st.last_error = kind;
        self.transition(&mut st, AppState::Error);
        if self.recover_locked(&mut st) {
            log::info!("recovered from {kind}");
        }
        st.global
    }

    /// Attempt recovery of the last reported fault.
    ///
    /// Device-level faults count as recovered here because the device stage
    /// performs the actual retry.  Processing and system faults need an
    /// operator [`restart`](Self::restart) and leave the state at `Error`.
    pub fn recover_from_error(&self) -> bool {
        let mut st = self.lock();
        match st.global {
            AppState::Running => true,
            AppState::Error => self.recover_locked(&mut st),
            _ => false,
        }
    }

    /// Operator restart: `Error → Running` and bump the restart epoch.
    pub fn restart(&self) -> bool {
        let mut st = self.lock();
        if st.global != AppState::Error {
            return false;
        }
        st.last_error = FaultKind::None;
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.transition(&mut st, AppState::Running);
        log::info!("pipeline restarted by operator");
        true
    }

    /// Enter `Terminating`.  Idempotent.
    pub fn begin_shutdown(&self) {
        let mut st = self.lock();
        if st.global != AppState::Terminating {
            self.transition(&mut st, AppState::Terminating);
        }
    }

    /// Park the caller until the next transition or `timeout`, whichever is
    /// first.
    pub fn idle(&self, timeout: Duration) {
        let guard = self.lock();
        let _ = self
            .changed
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn recover_locked(&self, st: &mut FaultState) -> bool {
        self.transition(st, AppState::Recovery);

        let recovered = st.last_error.is_auto_recoverable();
        if recovered {
            self.transition(st, AppState::Running);
        } else {
            log::warn!("{} requires a restart", st.last_error);
            self.transition(st, AppState::Error);
        }
        recovered
    }

    fn transition(&self, st: &mut FaultState, next: AppState) {
        if st.global == AppState::Terminating {
            return;
        }
        log::info!("global state {} -> {}", st.global, next);
        st.global = next;
        if st.history.len() == HISTORY_LEN {
            st.history.pop_front();
        }
        st.history.push_back(next);
        self.changed.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, FaultState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Watchdog
    // -----------------------------------------------------------------------

    /// Start the watchdog thread.  Returns `true` if it is running afterwards.
    pub fn start_watchdog(self: &Arc<Self>) -> bool {
        let mut slot = self
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return true;
        }

        self.ping.store(true, Ordering::Release);
        self.stalled.store(false, Ordering::Release);

        match WatchdogHandle::spawn(Arc::downgrade(self), self.watchdog_timeout) {
            Ok(handle) => {
                *slot = Some(handle);
                true
            }
            Err(e) => {
                log::error!("failed to spawn watchdog thread: {e}");
                false
            }
        }
    }

    /// Stop the watchdog thread.  Idempotent.
    pub fn stop_watchdog(&self) {
        let handle = self
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.stop();
        }
    }

    pub fn watchdog_running(&self) -> bool {
        self.watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Heartbeat.  Must be called more often than the watchdog timeout.
    pub fn ping_watchdog(&self) {
        self.ping.store(true, Ordering::Release);
    }

    /// Called by the watchdog once per window.  A stall is reported once and
    /// re-armed by the next heartbeat.
    pub(crate) fn check_heartbeat(&self) {
        if self.ping.swap(false, Ordering::AcqRel) {
            self.stalled.store(false, Ordering::Release);
            return;
        }
        if !self.stalled.swap(true, Ordering::AcqRel) {
            self.report_error(FaultKind::SystemFault, "watchdog timeout - pipeline stalled");
        }
    }
}

impl Drop for FaultController {
    fn drop(&mut self) {
        self.stop_watchdog();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
