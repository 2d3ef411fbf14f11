//! The beamforming stage.
//!
//! [`FrameProcessor`] is the per-frame algorithm:
//!
//! 1. every `doa_interval_frames` frames, ask the [`DoaEstimator`] for an
//!    angle and pass it through the [`SteeringSmoother`];
//! 2. look up per-channel delays for the current angle and time-align the
//!    channels with the delay lines;
//! 3. combine the aligned channels into one mono frame.
//!
//! [`BeamformingEngine`] runs it on its own thread between the capture and
//! output channels.  A frame that fails (including a panic escaping a
//! pluggable estimator) is reported as a processing fault; the engine then
//! stops consuming input until an operator restart.  The engine is the
//! pipeline's heartbeat: it pings the watchdog after every frame and while it
//! is deliberately idle.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::fault::FaultController;
use super::runner::PipelineError;
use super::stage::{join_stage, spawn_stage, Stage, StageShared};
use super::state::{AppState, FaultKind};
use crate::audio::{SampleChannel, WAIT_SLICE};
use crate::config::{BeamformerConfig, DoaMethod};
use crate::dsp::{
    ArrayGeometry, Combiner, CrossCorrelationDoa, DelayCompensator, DoaEstimator, FixedDoa,
    ProcessingError, SteeringSmoother, SteeringTable, MAX_ANGLE,
};

/// Build the estimator selected in `config`.
pub fn estimator_from_config(config: &BeamformerConfig) -> Box<dyn DoaEstimator> {
    match config.processing.doa_method {
        DoaMethod::Fixed => Box::new(FixedDoa::new(config.processing.fixed_angle)),
        DoaMethod::CrossCorrelation => Box::new(CrossCorrelationDoa::new(
            ArrayGeometry::from_config(config),
            config.processing.doa_energy_floor,
        )),
    }
}

// ---------------------------------------------------------------------------
// FrameProcessor
// ---------------------------------------------------------------------------

/// Steering, delay compensation and combination for one frame at a time.
pub struct FrameProcessor {
    channels: usize,
    frame_size: usize,
    table: SteeringTable,
    compensator: DelayCompensator,
    combiner: Combiner,
    doa: Box<dyn DoaEstimator>,
    smoother: SteeringSmoother,
    doa_interval: u64,
    frames: u64,
    angle: Arc<AtomicU16>,
    output: Vec<i16>,
}

impl FrameProcessor {
    pub fn new(config: &BeamformerConfig, doa: Box<dyn DoaEstimator>) -> Self {
        let geometry = ArrayGeometry::from_config(config);
        let channels = geometry.channels.max(1);
        let frame_size = config.audio.frame_size;
        let initial = config.processing.fixed_angle.min(MAX_ANGLE);
        Self {
            channels,
            frame_size,
            table: SteeringTable::new(&geometry),
            compensator: DelayCompensator::new(channels, geometry.max_delay, frame_size),
            combiner: Combiner::from_config(config),
            doa,
            smoother: SteeringSmoother::new(
                config.processing.smoothing,
                f32::from(config.processing.hysteresis_deg),
            ),
            doa_interval: u64::from(config.processing.doa_interval_frames.max(1)),
            frames: 0,
            angle: Arc::new(AtomicU16::new(initial)),
            output: vec![0; frame_size],
        }
    }

    /// Interleaved samples expected per input frame.
    pub fn frame_len(&self) -> usize {
        self.frame_size * self.channels
    }

    /// Shared handle to the steering angle, for readers on other threads.
    pub fn angle_handle(&self) -> Arc<AtomicU16> {
        Arc::clone(&self.angle)
    }

    pub fn current_angle(&self) -> u16 {
        self.angle.load(Ordering::Acquire)
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames
    }

    pub fn estimator_name(&self) -> &'static str {
        self.doa.name()
    }

    /// The mono frame produced by the last successful
    /// [`process_frame`](Self::process_frame).
    pub fn output(&self) -> &[i16] {
        &self.output
    }

    /// Process one interleaved frame into [`output`](Self::output).
    pub fn process_frame(&mut self, frame: &[i16]) -> Result<(), ProcessingError> {
        if frame.len() != self.frame_len() {
            return Err(ProcessingError::FrameLength {
                expected: self.frame_len(),
                actual: frame.len(),
            });
        }

        self.frames += 1;
        if self.frames % self.doa_interval == 0 {
            self.update_steering(frame);
        }

        let angle = self.current_angle();
        self.compensator.align(
            frame,
            self.table.channel_delays(angle),
            self.table.fractional_delays(angle),
        );
        self.combiner.combine(
            self.compensator.aligned(),
            self.compensator.residual(),
            &mut self.output,
        )
    }

    fn update_steering(&mut self, frame: &[i16]) {
        let Some(estimate) = self.doa.estimate(frame, self.channels) else {
            return;
        };
        let current = self.current_angle();
        if let Some(next) = self.smoother.update(estimate.min(MAX_ANGLE), current) {
            self.angle.store(next, Ordering::Release);
            log::debug!("steering {current}° -> {next}° (estimate {estimate}°)");
        }
    }

    /// Clear delay history and smoothing state, keeping the current angle.
    pub fn reset(&mut self) {
        self.compensator.reset();
        self.smoother.reset();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// BeamformingEngine
// ---------------------------------------------------------------------------

/// Stage that runs a [`FrameProcessor`] between two channels.
pub struct BeamformingEngine {
    shared: Arc<StageShared>,
    controller: Arc<FaultController>,
    input: Arc<SampleChannel>,
    output: Arc<SampleChannel>,
    angle: Arc<AtomicU16>,
    processor: Option<FrameProcessor>,
    thread: Option<JoinHandle<FrameProcessor>>,
    idle_poll: Duration,
    backpressure: Duration,
}

impl BeamformingEngine {
    pub fn new(
        config: &BeamformerConfig,
        controller: Arc<FaultController>,
        input: Arc<SampleChannel>,
        output: Arc<SampleChannel>,
        doa: Box<dyn DoaEstimator>,
    ) -> Self {
        let processor = FrameProcessor::new(config, doa);
        Self {
            shared: Arc::new(StageShared::new()),
            controller,
            input,
            output,
            angle: processor.angle_handle(),
            processor: Some(processor),
            thread: None,
            idle_poll: config.recovery.idle_poll(),
            backpressure: config.recovery.backpressure_timeout(),
        }
    }

    pub fn current_angle(&self) -> u16 {
        self.angle.load(Ordering::Acquire)
    }

    pub fn angle_handle(&self) -> Arc<AtomicU16> {
        Arc::clone(&self.angle)
    }

    /// The processor, while the stage thread is not holding it.
    pub fn processor(&self) -> Option<&FrameProcessor> {
        self.processor.as_ref()
    }
}

impl Stage for BeamformingEngine {
    fn name(&self) -> &'static str {
        "engine"
    }

    fn init(&mut self) -> Result<(), PipelineError> {
        match &self.processor {
            Some(p) => {
                log::info!(
                    "engine: {} frames × {} channels, DOA '{}', initial angle {}°",
                    p.frame_size,
                    p.channels,
                    p.estimator_name(),
                    p.current_angle()
                );
                Ok(())
            }
            None if self.thread.is_some() => Ok(()),
            None => Err(PipelineError::NotInitialized),
        }
    }

    fn start(&mut self) -> Result<(), PipelineError> {
        if self.thread.is_some() {
            return Ok(());
        }
        if self.shared.state() == AppState::Terminating {
            return Err(PipelineError::Terminated);
        }
        let Some(processor) = self.processor.take() else {
            return Err(PipelineError::NotInitialized);
        };

        self.shared.set_running(true);
        self.shared.set_state(AppState::Running);

        let worker = EngineWorker {
            shared: Arc::clone(&self.shared),
            controller: Arc::clone(&self.controller),
            input: Arc::clone(&self.input),
            output: Arc::clone(&self.output),
            idle_poll: self.idle_poll,
            backpressure: self.backpressure,
        };
        match spawn_stage("engine", move || worker.run(processor)) {
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
            if let Some(processor) = join_stage("engine", handle) {
                self.processor = Some(processor);
            }
            log::info!("engine: stopped");
        }
        self.shared.set_state(AppState::Terminating);
    }

    fn state(&self) -> AppState {
        self.shared.state()
    }
}

impl Drop for BeamformingEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

struct EngineWorker {
    shared: Arc<StageShared>,
    controller: Arc<FaultController>,
    input: Arc<SampleChannel>,
    output: Arc<SampleChannel>,
    idle_poll: Duration,
    backpressure: Duration,
}

impl EngineWorker {
    fn run(self, mut processor: FrameProcessor) -> FrameProcessor {
        log::info!("engine: thread started");
        let mut frame = vec![0_i16; processor.frame_len()];
        let mut fault_epoch = self.controller.epoch();
        let mut dropped = 0_u64;

        while self.shared.is_running() {
            if self.controller.state().is_blocking() {
                self.idle();
                continue;
            }
            if self.shared.state() == AppState::Error {
                if self.controller.epoch() == fault_epoch {
                    self.idle();
                    continue;
                }
                processor.reset();
                self.shared.set_state(AppState::Running);
                log::info!("engine: resuming after restart");
            }

            let got = self.input.read_exact_timeout(&mut frame, WAIT_SLICE);
            if got < frame.len() {
                if self.input.is_closed() {
                    log::info!("engine: input closed, leaving loop");
                    break;
                }
                continue;
            }

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| processor.process_frame(&frame)))
                .unwrap_or_else(|payload| Err(ProcessingError::Panicked(panic_message(&*payload))));

            match outcome {
                Ok(()) => {
                    let out = processor.output();
                    let written = self.output.write_timeout(out, self.backpressure);
                    if written < out.len() {
                        if self.output.is_closed() {
                            log::info!("engine: output closed, leaving loop");
                            break;
                        }
                        dropped += (out.len() - written) as u64;
                        log::warn!(
                            "engine: output backpressure, dropped {} samples ({dropped} total)",
                            out.len() - written
                        );
                    }
                    self.controller.ping_watchdog();
                }
                Err(e) => {
                    fault_epoch = self.controller.epoch();
                    self.shared.set_state(AppState::Error);
                    self.controller
                        .report_error(FaultKind::ProcessingFault, &format!("engine: {e}"));
                }
            }
        }

        self.shared.set_state(AppState::Terminating);
        log::info!(
            "engine: thread exiting after {} frames",
            processor.frames_processed()
        );
        processor
    }

    /// Deliberate idle: keep the watchdog fed and wait for a transition.
    fn idle(&self) {
        self.controller.ping_watchdog();
        self.controller.idle(self.idle_poll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::interleave;
    use crate::config::CombineMode;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;

    const FRAME: usize = 512;

    fn config(mode: CombineMode) -> BeamformerConfig {
        let mut config = BeamformerConfig::default();
        config.processing.mode = mode;
        config.processing.smoothing = 1.0;
        config.processing.hysteresis_deg = 0;
        config.recovery.idle_poll_ms = 5;
        config
    }

    fn constant_frame() -> Vec<i16> {
        interleave(&[vec![100; FRAME], vec![200; FRAME]])
    }

    /// Counts calls and returns a fixed angle.
    struct CountingDoa {
        calls: Arc<AtomicUsize>,
        angle: u16,
    }

    impl DoaEstimator for CountingDoa {
        fn estimate(&mut self, _frame: &[i16], _channels: usize) -> Option<u16> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(self.angle)
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    /// Panics on its first call only.
    struct PanickyDoa {
        panicked: bool,
    }

    impl DoaEstimator for PanickyDoa {
        fn estimate(&mut self, _frame: &[i16], _channels: usize) -> Option<u16> {
            if !self.panicked {
                self.panicked = true;
                panic!("estimator exploded");
            }
            None
        }

        fn name(&self) -> &'static str {
            "panicky"
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn averages_constant_channels_in_both_modes() {
        for mode in [CombineMode::TimeDomain, CombineMode::FrequencyDomain] {
            let mut processor = FrameProcessor::new(&config(mode), Box::new(FixedDoa::new(90)));
            processor.process_frame(&constant_frame()).unwrap();
            assert_eq!(processor.output().len(), FRAME);
            assert!(processor.output().iter().all(|&s| s == 150), "{mode:?}");
        }
    }

    #[test]
    fn doa_runs_on_cadence_and_steers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let doa = CountingDoa {
            calls: Arc::clone(&calls),
            angle: 120,
        };
        let mut processor = FrameProcessor::new(&config(CombineMode::TimeDomain), Box::new(doa));
        assert_eq!(processor.current_angle(), 90);

        for i in 1..=25 {
            processor.process_frame(&constant_frame()).unwrap();
            if i == 9 {
                assert_eq!(processor.current_angle(), 90);
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(processor.current_angle(), 120);
        assert_eq!(processor.frames_processed(), 25);
    }

    #[test]
    fn steered_channels_still_average() {
        // a constant signal is unchanged by any delay once the lines are full
        let mut processor = FrameProcessor::new(
            &config(CombineMode::TimeDomain),
            Box::new(FixedDoa::new(180)),
        );
        for _ in 0..10 {
            processor.process_frame(&constant_frame()).unwrap();
        }
        assert_eq!(processor.current_angle(), 180);
        processor.process_frame(&constant_frame()).unwrap();
        assert!(processor.output().iter().all(|&s| s == 150));
    }

    #[test]
    fn wrong_frame_length_is_rejected() {
        let mut processor = FrameProcessor::new(
            &config(CombineMode::TimeDomain),
            Box::new(FixedDoa::new(90)),
        );
        let err = processor.process_frame(&[0; 10]).unwrap_err();
        assert!(matches!(
            err,
            ProcessingError::FrameLength {
                expected: 1024,
                actual: 10
            }
        ));
    }

    fn engine_with(
        doa: Box<dyn DoaEstimator>,
    ) -> (BeamformingEngine, Arc<FaultController>, Arc<SampleChannel>, Arc<SampleChannel>) {
        let mut cfg = config(CombineMode::TimeDomain);
        cfg.processing.doa_interval_frames = 1;
        let controller = Arc::new(FaultController::new(Duration::from_secs(5)));
        controller.mark_running();
        let input = Arc::new(SampleChannel::new(4096));
        let output = Arc::new(SampleChannel::new(4096));
        let engine = BeamformingEngine::new(
            &cfg,
            Arc::clone(&controller),
            Arc::clone(&input),
            Arc::clone(&output),
            doa,
        );
        (engine, controller, input, output)
    }

    #[test]
    fn engine_moves_frames_and_exits_on_close() {
        let (mut engine, _controller, input, output) = engine_with(Box::new(FixedDoa::new(90)));
        engine.init().unwrap();
        engine.start().unwrap();

        input.write(&constant_frame());
        let mut out = vec![0_i16; FRAME];
        assert_eq!(output.read_timeout(&mut out, Duration::from_secs(2)), FRAME);
        assert!(out.iter().all(|&s| s == 150));

        input.close();
        wait_for(|| engine.state() == AppState::Terminating);
        engine.stop();
        engine.stop();
        assert_eq!(engine.processor().map(|p| p.frames_processed()), Some(1));
    }

    #[test]
    fn full_output_drops_samples_without_faulting() {
        let mut cfg = config(CombineMode::TimeDomain);
        cfg.recovery.backpressure_timeout_ms = 5;
        let controller = Arc::new(FaultController::new(Duration::from_secs(5)));
        controller.mark_running();
        let input = Arc::new(SampleChannel::new(4096));
        // nobody reads this one
        let output = Arc::new(SampleChannel::new(8));
        let mut engine = BeamformingEngine::new(
            &cfg,
            Arc::clone(&controller),
            Arc::clone(&input),
            Arc::clone(&output),
            Box::new(FixedDoa::new(90)),
        );
        engine.start().unwrap();

        for _ in 0..3 {
            input.write(&constant_frame());
        }
        wait_for(|| input.available() == 0);
        thread::sleep(Duration::from_millis(30));

        assert_eq!(output.available(), 7);
        assert_eq!(engine.state(), AppState::Running);
        assert_eq!(controller.state(), AppState::Running);
        assert_eq!(controller.fault_count(FaultKind::ProcessingFault), 0);

        engine.stop();
        assert_eq!(engine.processor().map(|p| p.frames_processed()), Some(3));
    }

    #[test]
    fn panicking_estimator_is_a_processing_fault() {
        let (mut engine, controller, input, output) =
            engine_with(Box::new(PanickyDoa { panicked: false }));
        engine.start().unwrap();

        input.write(&constant_frame());
        wait_for(|| controller.state() == AppState::Error);
        assert_eq!(controller.last_error(), FaultKind::ProcessingFault);
        assert_eq!(engine.state(), AppState::Error);

        // no input is consumed while in Error
        input.write(&constant_frame());
        thread::sleep(Duration::from_millis(30));
        assert_eq!(input.available(), FRAME * 2);

        assert!(controller.restart());
        let mut out = vec![0_i16; FRAME];
        assert_eq!(output.read_timeout(&mut out, Duration::from_secs(2)), FRAME);
        wait_for(|| engine.state() == AppState::Running);
        engine.stop();
    }
}
