//! Capture endpoint: device → channel.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use super::driver::{CaptureStream, DeviceError, PcmDriver, StreamParams, TransferFault};
use super::endpoint::{Endpoint, Step};
use super::recovery::{transfer_with_recovery, RecoveryPolicy};
use crate::audio::{is_silent, peak, SampleChannel};
use crate::config::BeamformerConfig;

/// Reads one period per step and pushes it into the capture channel.
pub struct CaptureEndpoint {
    driver: Arc<dyn PcmDriver>,
    params: StreamParams,
    stream: Option<Box<dyn CaptureStream>>,
    sink: Arc<SampleChannel>,
    policy: RecoveryPolicy,
    backpressure: Duration,
    buf: Vec<i16>,
    silent_run: u64,
    dropped: u64,
}

impl CaptureEndpoint {
    pub fn new(
        driver: Arc<dyn PcmDriver>,
        config: &BeamformerConfig,
        sink: Arc<SampleChannel>,
    ) -> Self {
        let params = StreamParams::capture(config);
        Self {
            buf: vec![0; params.period_samples()],
            driver,
            params,
            stream: None,
            sink,
            policy: RecoveryPolicy::from_config(config),
            backpressure: config.recovery.backpressure_timeout(),
            silent_run: 0,
            dropped: 0,
        }
    }

    /// Samples dropped because the capture channel stayed full.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped
    }
}

impl Endpoint for CaptureEndpoint {
    fn name(&self) -> &'static str {
        "capture"
    }

    fn open(&mut self) -> Result<(), DeviceError> {
        let stream = self.driver.open_capture(&self.params)?;
        log::info!(
            "capture: '{}' via {} at {} Hz, {} channels, {} frames/period",
            self.params.device,
            self.driver.name(),
            self.params.sample_rate,
            self.params.channels,
            self.params.period_frames
        );
        self.stream = Some(stream);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn step(&mut self, running: &AtomicBool) -> Step {
        if self.sink.is_closed() {
            return Step::Exit;
        }
        let Some(stream) = self.stream.as_mut() else {
            return Step::Exit;
        };

        let buf = &mut self.buf;
        let frames = match transfer_with_recovery(stream.as_mut(), &self.policy, running, |s| {
            s.read_frames(buf.as_mut_slice())
        }) {
            Ok(frames) => frames,
            Err(e) => return Step::Fault(e),
        };
        if frames == 0 {
            return Step::Continue;
        }

        let len = (frames * usize::from(self.params.channels)).min(self.buf.len());
        let samples = &self.buf[..len];
        log::trace!("capture: {frames} frames, peak {}", peak(samples));

        if is_silent(samples) {
            if self.silent_run == 0 {
                log::warn!("capture: all-zero period, check the microphones");
            }
            self.silent_run += 1;
        } else {
            if self.silent_run > 1 {
                log::debug!("capture: signal back after {} silent periods", self.silent_run);
            }
            self.silent_run = 0;
        }

        let written = self.sink.write_timeout(samples, self.backpressure);
        if written < len {
            if self.sink.is_closed() {
                return Step::Exit;
            }
            self.dropped += (len - written) as u64;
            log::warn!(
                "capture: channel full, dropped {} samples ({} total)",
                len - written,
                self.dropped
            );
        }
        Step::Continue
    }

    fn rearm(&mut self) -> Result<(), TransferFault> {
        match self.stream.as_mut() {
            Some(stream) => stream.prepare(),
            None => Err(TransferFault::Other("capture stream not open".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SimulatedDriver, ToneSpec};

    fn config() -> BeamformerConfig {
        let mut config = BeamformerConfig::default();
        config.audio.frame_size = 64;
        config.audio.channel_capacity = 1024;
        config.recovery.backpressure_timeout_ms = 5;
        config
    }

    fn endpoint(driver: &SimulatedDriver, sink: &Arc<SampleChannel>) -> CaptureEndpoint {
        let mut capture = CaptureEndpoint::new(Arc::new(driver.clone()), &config(), Arc::clone(sink));
        capture.open().unwrap();
        capture
    }

    #[test]
    fn step_moves_one_period_into_the_channel() {
        let driver = SimulatedDriver::new();
        let sink = Arc::new(SampleChannel::new(1024));
        let mut capture = endpoint(&driver, &sink);
        let running = AtomicBool::new(true);

        assert!(matches!(capture.step(&running), Step::Continue));
        assert_eq!(sink.available(), 128);
    }

    #[test]
    fn overrun_is_recovered_inside_the_step() {
        let driver = SimulatedDriver::new();
        let sink = Arc::new(SampleChannel::new(1024));
        let mut capture = endpoint(&driver, &sink);
        let running = AtomicBool::new(true);

        driver.inject_capture_fault(TransferFault::Overrun);
        assert!(matches!(capture.step(&running), Step::Continue));
        assert_eq!(driver.prepare_count(), 1);
        assert_eq!(sink.available(), 128);
    }

    #[test]
    fn failed_prepare_becomes_a_fault() {
        let driver = SimulatedDriver::new();
        let sink = Arc::new(SampleChannel::new(1024));
        let mut capture = endpoint(&driver, &sink);
        let running = AtomicBool::new(true);

        driver.inject_capture_fault(TransferFault::Underrun);
        driver.script_prepare([Err(TransferFault::Other("io".into()))]);
        assert!(matches!(capture.step(&running), Step::Fault(_)));
        assert!(capture.rearm().is_ok());
        assert!(matches!(capture.step(&running), Step::Continue));
    }

    #[test]
    fn full_channel_drops_and_closed_channel_exits() {
        let driver = SimulatedDriver::new().with_tone(ToneSpec::default());
        let sink = Arc::new(SampleChannel::new(256));
        let mut capture = endpoint(&driver, &sink);
        let running = AtomicBool::new(true);

        assert!(matches!(capture.step(&running), Step::Continue));
        assert!(matches!(capture.step(&running), Step::Continue));
        assert_eq!(capture.dropped_samples(), 1);

        sink.close();
        assert!(matches!(capture.step(&running), Step::Exit));
    }
}
