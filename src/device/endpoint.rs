//! [`RecoverableDevice`]: one hardware endpoint driven on its own thread.
//!
//! The endpoint-specific work (one transfer per iteration) lives behind the
//! [`Endpoint`] trait; this module owns the per-iteration state handling:
//!
//! 1. While the global state is `Error`, `Recovery` or `Terminating`, park on
//!    the fault controller instead of transferring.
//! 2. If this stage is in local `Error`, re-arm the stream once an operator
//!    restart happened or while fewer than `max_xrun_retries` consecutive
//!    failures have occurred; otherwise keep waiting.
//! 3. Run one [`Endpoint::step`].  A failed local recovery is reported to the
//!    fault controller and moves the stage to local `Error`.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::driver::{DeviceError, TransferFault};
use super::recovery::RecoveryError;
use crate::config::RecoveryConfig;
use crate::pipeline::stage::{join_stage, spawn_stage, Stage, StageShared};
use crate::pipeline::{AppState, FaultController, FaultKind, PipelineError};

/// Outcome of one endpoint iteration.
#[derive(Debug)]
pub enum Step {
    /// A period was transferred.
    Continue,
    /// Nothing to do right now; back off for one idle interval.
    Idle,
    /// Local recovery failed.
    Fault(RecoveryError),
    /// The channel feeding or fed by this endpoint is closed.
    Exit,
}

/// One direction of hardware I/O.
pub trait Endpoint: Send + 'static {
    fn name(&self) -> &'static str;

    /// Open and configure the device.
    fn open(&mut self) -> Result<(), DeviceError>;

    fn is_open(&self) -> bool;

    /// Runs once on the stage thread before the first step.
    fn on_start(&mut self, _running: &AtomicBool) {}

    /// One transfer.  `running` bounds any polling inside recovery.
    fn step(&mut self, running: &AtomicBool) -> Step;

    /// Put a faulted stream back into a runnable state.
    fn rearm(&mut self) -> Result<(), TransferFault>;

    /// Runs once on the stage thread after the loop exits.
    fn on_stop(&mut self) {}
}

// ---------------------------------------------------------------------------
// RecoverableDevice
// ---------------------------------------------------------------------------

/// Stage wrapper that runs an [`Endpoint`] with the recovery rules above.
pub struct RecoverableDevice<E: Endpoint> {
    name: &'static str,
    shared: Arc<StageShared>,
    controller: Arc<FaultController>,
    endpoint: Option<E>,
    thread: Option<JoinHandle<E>>,
    idle_poll: Duration,
    max_retries: u32,
}

impl<E: Endpoint> RecoverableDevice<E> {
    pub fn new(endpoint: E, controller: Arc<FaultController>, recovery: &RecoveryConfig) -> Self {
        Self {
            name: endpoint.name(),
            shared: Arc::new(StageShared::new()),
            controller,
            endpoint: Some(endpoint),
            thread: None,
            idle_poll: recovery.idle_poll(),
            max_retries: recovery.max_xrun_retries.max(1),
        }
    }

    /// The endpoint, while the stage thread is not holding it.
    pub fn endpoint(&self) -> Option<&E> {
        self.endpoint.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }
}

impl<E: Endpoint> Stage for RecoverableDevice<E> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn init(&mut self) -> Result<(), PipelineError> {
        match self.endpoint.as_mut() {
            Some(endpoint) if !endpoint.is_open() => {
                endpoint.open()?;
                log::info!("{}: device opened", self.name);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn start(&mut self) -> Result<(), PipelineError> {
        if self.thread.is_some() {
            return Ok(());
        }
        if self.shared.state() == AppState::Terminating {
            return Err(PipelineError::Terminated);
        }
        let Some(endpoint) = self.endpoint.take() else {
            return Err(PipelineError::NotInitialized);
        };
        if !endpoint.is_open() {
            self.endpoint = Some(endpoint);
            return Err(PipelineError::NotInitialized);
        }

        self.shared.set_running(true);
        self.shared.set_state(AppState::Running);

        let worker = Worker {
            shared: Arc::clone(&self.shared),
            controller: Arc::clone(&self.controller),
            idle_poll: self.idle_poll,
            max_retries: self.max_retries,
        };
        match spawn_stage(self.name, move || worker.run(endpoint)) {
            Ok(handle) => {
                self.thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.set_running(false);
                self.shared.set_state(AppState::Error);
                Err(e)
            }
        }
    }

    fn stop(&mut self) {
        self.shared.set_running(false);
        if let Some(handle) = self.thread.take() {
            if let Some(endpoint) = join_stage(self.name, handle) {
                self.endpoint = Some(endpoint);
            }
            log::info!("{}: stopped", self.name);
        }
        self.shared.set_state(AppState::Terminating);
    }

    fn state(&self) -> AppState {
        self.shared.state()
    }
}

impl<E: Endpoint> Drop for RecoverableDevice<E> {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

struct Worker {
    shared: Arc<StageShared>,
    controller: Arc<FaultController>,
    idle_poll: Duration,
    max_retries: u32,
}

impl Worker {
    fn run<E: Endpoint>(self, mut endpoint: E) -> E {
        let name = endpoint.name();
        let running = self.shared.running_flag();
        log::info!("{name}: thread started");
        endpoint.on_start(running);

        let mut failures = 0_u32;
        let mut fault_epoch = self.controller.epoch();

        while self.shared.is_running() {
            if self.controller.state().is_blocking() {
                self.controller.idle(self.idle_poll);
                continue;
            }

            if self.shared.state() == AppState::Error {
                if self.controller.epoch() != fault_epoch {
                    failures = 0;
                    fault_epoch = self.controller.epoch();
                }
                if failures >= self.max_retries {
                    self.controller.idle(self.idle_poll);
                    continue;
                }
                match endpoint.rearm() {
                    Ok(()) => {
                        log::info!("{name}: stream re-armed");
                        self.shared.set_state(AppState::Running);
                    }
                    Err(fault) => {
                        log::error!("{name}: re-arm failed: {fault}");
                        self.count_failure(name, &mut failures);
                        self.controller.idle(self.idle_poll);
                        continue;
                    }
                }
            }

            match endpoint.step(running) {
                Step::Continue => failures = 0,
                Step::Idle => self.controller.idle(self.idle_poll),
                Step::Fault(err) => {
                    fault_epoch = self.controller.epoch();
                    self.shared.set_state(AppState::Error);
                    self.controller
                        .report_error(err.fault_kind(), &format!("{name}: {err}"));
                    self.count_failure(name, &mut failures);
                }
                Step::Exit => {
                    log::info!("{name}: channel closed, leaving loop");
                    break;
                }
            }
        }

        endpoint.on_stop();
        self.shared.set_state(AppState::Terminating);
        log::info!("{name}: thread exiting");
        endpoint
    }

    /// Escalate once the consecutive failure budget is spent.
    fn count_failure(&self, name: &str, failures: &mut u32) {
        *failures += 1;
        if *failures == self.max_retries {
            self.controller.report_error(
                FaultKind::SystemFault,
                &format!("{name}: {failures} consecutive recovery failures, waiting for restart"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    use crate::device::driver::TransferFault;

    #[derive(Default)]
    struct Counters {
        steps: AtomicUsize,
        rearms: AtomicUsize,
        stops: AtomicUsize,
    }

    /// Endpoint whose step results follow a script, then continue forever.
    struct ScriptedEndpoint {
        open: bool,
        script: VecDeque<Step>,
        rearm_ok: bool,
        counters: Arc<Counters>,
    }

    impl ScriptedEndpoint {
        fn new(script: Vec<Step>, rearm_ok: bool) -> (Self, Arc<Counters>) {
            let counters = Arc::new(Counters::default());
            (
                Self {
                    open: false,
                    script: script.into(),
                    rearm_ok,
                    counters: Arc::clone(&counters),
                },
                counters,
            )
        }
    }

    impl Endpoint for ScriptedEndpoint {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn open(&mut self) -> Result<(), DeviceError> {
            self.open = true;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn step(&mut self, _running: &AtomicBool) -> Step {
            self.counters.steps.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(1));
            self.script.pop_front().unwrap_or(Step::Continue)
        }

        fn rearm(&mut self) -> Result<(), TransferFault> {
            self.counters.rearms.fetch_add(1, Ordering::SeqCst);
            if self.rearm_ok {
                Ok(())
            } else {
                Err(TransferFault::Other("still broken".into()))
            }
        }

        fn on_stop(&mut self) {
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn recovery() -> RecoveryConfig {
        RecoveryConfig {
            idle_poll_ms: 5,
            max_xrun_retries: 3,
            ..RecoveryConfig::default()
        }
    }

    fn running_controller() -> Arc<FaultController> {
        let controller = Arc::new(FaultController::new(Duration::from_secs(5)));
        controller.mark_running();
        controller
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn underrun_fault() -> Step {
        Step::Fault(RecoveryError::Retry {
            fault: TransferFault::Underrun,
            source: TransferFault::Underrun,
        })
    }

    #[test]
    fn start_requires_init() {
        let (endpoint, _) = ScriptedEndpoint::new(vec![], true);
        let mut device = RecoverableDevice::new(endpoint, running_controller(), &recovery());
        assert!(matches!(device.start(), Err(PipelineError::NotInitialized)));
        device.init().unwrap();
        device.start().unwrap();
        device.start().unwrap();
        device.stop();
    }

    #[test]
    fn stop_is_idempotent_and_returns_the_endpoint() {
        let (endpoint, counters) = ScriptedEndpoint::new(vec![], true);
        let mut device = RecoverableDevice::new(endpoint, running_controller(), &recovery());
        device.init().unwrap();
        device.start().unwrap();
        wait_for(|| counters.steps.load(Ordering::SeqCst) > 3);

        device.stop();
        device.stop();
        assert_eq!(device.state(), AppState::Terminating);
        assert!(device.endpoint().is_some());
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
        assert!(matches!(device.start(), Err(PipelineError::Terminated)));
    }

    #[test]
    fn transient_fault_is_rearmed() {
        let controller = running_controller();
        let (endpoint, counters) = ScriptedEndpoint::new(vec![underrun_fault()], true);
        let mut device = RecoverableDevice::new(endpoint, Arc::clone(&controller), &recovery());
        device.init().unwrap();
        device.start().unwrap();

        wait_for(|| counters.rearms.load(Ordering::SeqCst) == 1);
        wait_for(|| device.state() == AppState::Running);
        assert_eq!(controller.state(), AppState::Running);
        assert_eq!(controller.last_error(), FaultKind::DeviceUnderrunOverrun);
        device.stop();
    }

    #[test]
    fn exhausted_retries_wait_for_restart() {
        let controller = running_controller();
        let (endpoint, counters) = ScriptedEndpoint::new(vec![underrun_fault()], false);
        let mut device = RecoverableDevice::new(endpoint, Arc::clone(&controller), &recovery());
        device.init().unwrap();
        device.start().unwrap();

        // 1 step fault + 2 failed re-arms = 3 consecutive failures
        wait_for(|| controller.state() == AppState::Error);
        assert_eq!(controller.last_error(), FaultKind::SystemFault);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counters.rearms.load(Ordering::SeqCst), 2);
        assert_eq!(device.state(), AppState::Error);

        assert!(controller.restart());
        wait_for(|| counters.rearms.load(Ordering::SeqCst) > 2);
        device.stop();
    }

    #[test]
    fn exit_leaves_the_loop() {
        let (endpoint, counters) = ScriptedEndpoint::new(vec![Step::Exit], true);
        let mut device = RecoverableDevice::new(endpoint, running_controller(), &recovery());
        device.init().unwrap();
        device.start().unwrap();
        wait_for(|| device.state() == AppState::Terminating);
        assert_eq!(counters.steps.load(Ordering::SeqCst), 1);
        device.stop();
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blocked_global_state_pauses_steps() {
        let controller = running_controller();
        let (endpoint, counters) = ScriptedEndpoint::new(vec![], true);
        let mut device = RecoverableDevice::new(endpoint, Arc::clone(&controller), &recovery());
        device.init().unwrap();

        controller.report_error(FaultKind::ProcessingFault, "engine broke");
        device.start().unwrap();
        thread::sleep(Duration::from_millis(40));
        assert_eq!(counters.steps.load(Ordering::SeqCst), 0);

        controller.restart();
        wait_for(|| counters.steps.load(Ordering::SeqCst) > 0);
        device.stop();
    }
}
