//! Pipeline orchestrator: capture → engine → output.
//!
//! [`BeamformerPipeline`] owns both inter-stage channels, the three stages and
//! the shared [`FaultController`].
//!
//! # Lifecycle
//!
//! ```text
//! new()   validate config, build channels and stages
//! init()  open capture + playback devices, Init → Running
//! start() spawn output, engine, capture (sink before source), then watchdog
//! stop()  Terminating, close channels, stop watchdog, join capture, engine,
//!         output.  Idempotent; also runs on Drop.
//! ```
//!
//! Signal handling is not done here: the binary sets a flag from its handler
//! and the thread that owns the pipeline calls [`stop`](BeamformerPipeline::stop).

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::engine::{estimator_from_config, BeamformingEngine};
use super::fault::FaultController;
use super::stage::Stage;
use super::state::{AppState, FaultKind};
use crate::audio::SampleChannel;
use crate::config::{BeamformerConfig, ConfigError};
use crate::device::{CaptureEndpoint, DeviceError, OutputEndpoint, PcmDriver, RecoverableDevice};
use crate::dsp::DoaEstimator;

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

/// Errors returned by the lifecycle surface.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("stage used before init")]
    NotInitialized,

    #[error("pipeline is terminating")]
    Terminated,

    #[error("failed to spawn {stage} thread: {source}")]
    Spawn {
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("watchdog thread could not be started")]
    Watchdog,

    #[error("restart refused in state {0}")]
    RestartRefused(AppState),
}

// ---------------------------------------------------------------------------
// BeamformerPipeline
// ---------------------------------------------------------------------------

/// The complete capture → beamform → playback pipeline.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use mic_beamformer::config::BeamformerConfig;
/// use mic_beamformer::device::SimulatedDriver;
/// use mic_beamformer::pipeline::BeamformerPipeline;
///
/// let config = BeamformerConfig::default();
/// let driver = Arc::new(SimulatedDriver::new().realtime(true));
/// let mut pipeline = BeamformerPipeline::new(config, driver).unwrap();
/// pipeline.start().unwrap();
/// println!("steering at {}°", pipeline.current_angle());
/// pipeline.stop();
/// ```
pub struct BeamformerPipeline {
    controller: Arc<FaultController>,
    capture_channel: Arc<SampleChannel>,
    output_channel: Arc<SampleChannel>,
    capture: RecoverableDevice<CaptureEndpoint>,
    engine: BeamformingEngine,
    output: RecoverableDevice<OutputEndpoint>,
    angle: Arc<AtomicU16>,
    initialized: bool,
    stopped: bool,
}

impl BeamformerPipeline {
    /// Build a pipeline using the DOA estimator selected in `config`.
    pub fn new(config: BeamformerConfig, driver: Arc<dyn PcmDriver>) -> Result<Self, PipelineError> {
        let estimator = estimator_from_config(&config);
        Self::with_estimator(config, driver, estimator)
    }

    /// Build a pipeline with a caller-supplied DOA estimator.
    pub fn with_estimator(
        config: BeamformerConfig,
        driver: Arc<dyn PcmDriver>,
        estimator: Box<dyn DoaEstimator>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let capacity = config.audio.channel_capacity;
        let capture_channel = Arc::new(SampleChannel::new(capacity));
        let output_channel = Arc::new(SampleChannel::new(capacity));
        let controller = Arc::new(FaultController::new(config.recovery.watchdog_timeout()));

        let capture = RecoverableDevice::new(
            CaptureEndpoint::new(Arc::clone(&driver), &config, Arc::clone(&capture_channel)),
            Arc::clone(&controller),
            &config.recovery,
        );
        let engine = BeamformingEngine::new(
            &config,
            Arc::clone(&controller),
            Arc::clone(&capture_channel),
            Arc::clone(&output_channel),
            estimator,
        );
        let output = RecoverableDevice::new(
            OutputEndpoint::new(driver, &config, Arc::clone(&output_channel)),
            Arc::clone(&controller),
            &config.recovery,
        );

        Ok(Self {
            angle: engine.angle_handle(),
            controller,
            capture_channel,
            output_channel,
            capture,
            engine,
            output,
            initialized: false,
            stopped: false,
        })
    }

    /// Open both devices and move the controller to `Running`.
    ///
    /// A device that cannot be opened is fatal; the pipeline is left in
    /// `Init` and can be dropped.
    pub fn init(&mut self) -> Result<(), PipelineError> {
        if self.stopped {
            return Err(PipelineError::Terminated);
        }
        if self.initialized {
            return Ok(());
        }

        if let Err(e) = self.init_stages() {
            log::error!("pipeline init failed: {e}");
            return Err(e);
        }
        self.initialized = true;
        self.controller.mark_running();
        log::info!("pipeline initialised");
        Ok(())
    }

    fn init_stages(&mut self) -> Result<(), PipelineError> {
        self.capture.init()?;
        self.output.init()?;
        self.engine.init()
    }

    /// Start every stage thread and the watchdog, running `init` first if
    /// needed.  On failure everything already started is stopped again.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        self.init()?;
        if let Err(e) = self.start_stages() {
            log::error!("pipeline start failed: {e}");
            self.stop();
            return Err(e);
        }
        log::info!("pipeline started");
        Ok(())
    }

    fn start_stages(&mut self) -> Result<(), PipelineError> {
        self.output.start()?;
        self.engine.start()?;
        self.capture.start()?;
        if !self.controller.start_watchdog() {
            return Err(PipelineError::Watchdog);
        }
        Ok(())
    }

    /// Shut down.  Safe to call any number of times.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        log::info!("pipeline stopping");

        self.controller.begin_shutdown();
        self.capture_channel.close();
        self.output_channel.close();
        self.controller.stop_watchdog();

        self.capture.stop();
        self.engine.stop();
        self.output.stop();
        log::info!("pipeline stopped");
    }

    /// Operator restart out of `Error`.
    ///
    /// Stages that faulted re-arm on their next poll.
    pub fn restart(&self) -> Result<(), PipelineError> {
        if self.controller.restart() {
            Ok(())
        } else {
            Err(PipelineError::RestartRefused(self.controller.state()))
        }
    }

    /// Global state.
    pub fn state(&self) -> AppState {
        self.controller.state()
    }

    pub fn last_error(&self) -> FaultKind {
        self.controller.last_error()
    }

    /// Current steering angle in degrees.
    pub fn current_angle(&self) -> u16 {
        self.angle.load(Ordering::Acquire)
    }

    pub fn controller(&self) -> &Arc<FaultController> {
        &self.controller
    }

    /// Local state of each stage, in data-flow order.
    pub fn stage_states(&self) -> [(&'static str, AppState); 3] {
        [
            (self.capture.name(), self.capture.state()),
            (self.engine.name(), self.engine.state()),
            (self.output.name(), self.output.state()),
        ]
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Block until `shutdown` is set, logging a status line every
    /// `status_every`.  Does not call [`stop`](Self::stop).
    pub fn run_until(&self, shutdown: &AtomicBool, status_every: Duration) {
        let tick = Duration::from_millis(100).min(status_every.max(Duration::from_millis(1)));
        let mut last_status = Instant::now();
        let mut last_state = self.state();

        while !shutdown.load(Ordering::Acquire) {
            thread::sleep(tick);

            let state = self.state();
            if state != last_state {
                if state == AppState::Error {
                    log::warn!(
                        "pipeline degraded ({}); waiting for restart or shutdown",
                        self.last_error()
                    );
                }
                last_state = state;
            }
            if state == AppState::Terminating {
                break;
            }

            if last_status.elapsed() >= status_every {
                last_status = Instant::now();
                self.log_status();
            }
        }
    }

    fn log_status(&self) {
        let [capture, engine, output] = self.stage_states();
        log::info!(
            "status: {} | angle {}° | capture {} engine {} output {} | queued {}/{} | faults xrun {} suspend {} processing {} system {}",
            self.state(),
            self.current_angle(),
            capture.1,
            engine.1,
            output.1,
            self.capture_channel.available(),
            self.output_channel.available(),
            self.controller.fault_count(FaultKind::DeviceUnderrunOverrun),
            self.controller.fault_count(FaultKind::DeviceSuspend),
            self.controller.fault_count(FaultKind::ProcessingFault),
            self.controller.fault_count(FaultKind::SystemFault),
        );
    }
}

impl Drop for BeamformerPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Direction, SimulatedDriver};

    fn config() -> BeamformerConfig {
        let mut config = BeamformerConfig::default();
        config.audio.frame_size = 64;
        config.audio.channel_capacity = 1024;
        config.processing.fft_size = 128;
        config.recovery.idle_poll_ms = 10;
        config.recovery.backpressure_timeout_ms = 10;
        config
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut cfg = config();
        cfg.audio.channel_capacity = 1000;
        let err = BeamformerPipeline::new(cfg, Arc::new(SimulatedDriver::new()))
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Config(ConfigError::CapacityNotPowerOfTwo(1000))));
    }

    #[test]
    fn open_failure_is_fatal_to_init() {
        let driver = SimulatedDriver::new();
        driver.fail_open(Direction::Playback);
        let mut pipeline = BeamformerPipeline::new(config(), Arc::new(driver)).unwrap();

        assert!(matches!(pipeline.init(), Err(PipelineError::Device(_))));
        assert_eq!(pipeline.state(), AppState::Init);
        pipeline.stop();
        assert_eq!(pipeline.state(), AppState::Terminating);
    }

    #[test]
    fn init_marks_running_and_reports_initial_angle() {
        let mut pipeline =
            BeamformerPipeline::new(config(), Arc::new(SimulatedDriver::new())).unwrap();
        pipeline.init().unwrap();
        assert_eq!(pipeline.state(), AppState::Running);
        assert_eq!(pipeline.current_angle(), 90);
        assert_eq!(pipeline.controller().transitions(), vec![AppState::Init, AppState::Running]);
    }

    #[test]
    fn restart_is_refused_unless_in_error() {
        let mut pipeline =
            BeamformerPipeline::new(config(), Arc::new(SimulatedDriver::new())).unwrap();
        pipeline.init().unwrap();
        assert!(matches!(
            pipeline.restart(),
            Err(PipelineError::RestartRefused(AppState::Running))
        ));

        pipeline
            .controller()
            .report_error(FaultKind::SystemFault, "test");
        assert!(pipeline.restart().is_ok());
        assert_eq!(pipeline.state(), AppState::Running);
    }

    #[test]
    fn stop_twice_and_start_after_stop() {
        let mut pipeline =
            BeamformerPipeline::new(config(), Arc::new(SimulatedDriver::new())).unwrap();
        pipeline.start().unwrap();
        pipeline.stop();
        pipeline.stop();

        assert!(pipeline.is_stopped());
        assert_eq!(pipeline.state(), AppState::Terminating);
        assert!(pipeline
            .stage_states()
            .iter()
            .all(|(_, state)| *state == AppState::Terminating));
        assert!(!pipeline.controller().watchdog_running());
        assert!(matches!(pipeline.start(), Err(PipelineError::Terminated)));
    }

    #[test]
    fn run_until_returns_when_flag_is_set() {
        let pipeline =
            BeamformerPipeline::new(config(), Arc::new(SimulatedDriver::new())).unwrap();
        let shutdown = AtomicBool::new(true);
        let started = Instant::now();
        pipeline.run_until(&shutdown, Duration::from_millis(10));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
