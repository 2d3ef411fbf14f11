//! Liveness watchdog thread.
//!
//! The thread wakes once per timeout window and asks the
//! [`FaultController`] whether a heartbeat arrived since the previous
//! window.  It holds only a [`Weak`] reference so a forgotten watchdog never
//! keeps the controller alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::fault::FaultController;

/// Upper bound on how long the thread sleeps before re-checking its stop flag.
const STOP_POLL: Duration = Duration::from_millis(100);

/// Handle to a running watchdog thread.  Owned by the [`FaultController`].
pub(crate) struct WatchdogHandle {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl WatchdogHandle {
    /// Spawn the watchdog thread.
    pub(crate) fn spawn(
        controller: Weak<FaultController>,
        timeout: Duration,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let thread = thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || watchdog_loop(controller, timeout, flag))?;

        Ok(Self { running, thread })
    }

    /// Signal the thread and wait for it to exit.
    pub(crate) fn stop(self) {
        self.running.store(false, Ordering::Release);
        self.thread.thread().unpark();

        // The last controller reference can be released on the watchdog thread
        // itself; joining there would never return.
        if self.thread.thread().id() == thread::current().id() {
            return;
        }
        if self.thread.join().is_err() {
            log::error!("watchdog thread panicked");
        }
    }
}

fn watchdog_loop(controller: Weak<FaultController>, timeout: Duration, running: Arc<AtomicBool>) {
    log::info!("watchdog started ({} ms window)", timeout.as_millis());

    'outer: loop {
        let deadline = Instant::now() + timeout;
        loop {
            if !running.load(Ordering::Acquire) {
                break 'outer;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout((deadline - now).min(STOP_POLL));
        }

        match controller.upgrade() {
            Some(controller) => controller.check_heartbeat(),
            None => break,
        }
    }

    log::info!("watchdog stopped");
}
