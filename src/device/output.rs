//! Output endpoint: channel → device.
//!
//! The beamformer produces mono; with more than one output channel each
//! period is duplicated across channels.  Short or missing input is padded
//! with silence so the device is never starved by a slow engine, but only
//! `max_silence_periods` consecutive silent periods are written before the
//! endpoint backs off.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use super::driver::{DeviceError, PcmDriver, PlaybackStream, StreamParams, TransferFault};
use super::endpoint::{Endpoint, Step};
use super::recovery::{transfer_with_recovery, RecoveryPolicy};
use crate::audio::SampleChannel;
use crate::config::BeamformerConfig;

/// Pulls one period per step from the output channel and plays it.
pub struct OutputEndpoint {
    driver: Arc<dyn PcmDriver>,
    params: StreamParams,
    stream: Option<Box<dyn PlaybackStream>>,
    source: Arc<SampleChannel>,
    policy: RecoveryPolicy,
    period_timeout: Duration,
    prefill_periods: u32,
    max_silence_periods: u32,
    mono: Vec<i16>,
    buf: Vec<i16>,
    silence_run: u32,
    padded_periods: u64,
}

impl OutputEndpoint {
    pub fn new(
        driver: Arc<dyn PcmDriver>,
        config: &BeamformerConfig,
        source: Arc<SampleChannel>,
    ) -> Self {
        let params = StreamParams::playback(config);
        Self {
            mono: vec![0; params.period_frames],
            buf: vec![0; params.period_samples()],
            driver,
            params,
            stream: None,
            source,
            policy: RecoveryPolicy::from_config(config),
            period_timeout: config.audio.frame_period(),
            prefill_periods: config.recovery.prefill_periods,
            max_silence_periods: config.recovery.max_silence_periods,
            silence_run: 0,
            padded_periods: 0,
        }
    }

    /// Periods that had to be completed with silence.
    pub fn padded_periods(&self) -> u64 {
        self.padded_periods
    }

    fn expand(&mut self) {
        let channels = usize::from(self.params.channels).max(1);
        for (frame, &sample) in self.buf.chunks_exact_mut(channels).zip(self.mono.iter()) {
            frame.fill(sample);
        }
    }

    fn play(&mut self, running: &AtomicBool) -> Step {
        let Some(stream) = self.stream.as_mut() else {
            return Step::Exit;
        };
        let buf = &self.buf;
        match transfer_with_recovery(stream.as_mut(), &self.policy, running, |s| {
            s.write_frames(buf.as_slice())
        }) {
            Ok(frames) => {
                if frames < self.params.period_frames {
                    log::debug!(
                        "output: device took {frames}/{} frames",
                        self.params.period_frames
                    );
                }
                Step::Continue
            }
            Err(e) => Step::Fault(e),
        }
    }
}

impl Endpoint for OutputEndpoint {
    fn name(&self) -> &'static str {
        "output"
    }

    fn open(&mut self) -> Result<(), DeviceError> {
        let stream = self.driver.open_playback(&self.params)?;
        log::info!(
            "output: '{}' via {} at {} Hz, {} channels, {} frames/period",
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

    fn on_start(&mut self, _running: &AtomicBool) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        self.buf.fill(0);
        for _ in 0..self.prefill_periods {
            if let Err(e) = stream.write_frames(&self.buf) {
                log::warn!("output: prefill failed: {e}");
                break;
            }
        }
        log::debug!("output: prefilled {} silent periods", self.prefill_periods);
    }

    fn step(&mut self, running: &AtomicBool) -> Step {
        let got = self.source.read_timeout(&mut self.mono, self.period_timeout);

        if got == 0 {
            if self.source.is_closed() {
                return Step::Exit;
            }
            if self.silence_run >= self.max_silence_periods {
                return Step::Idle;
            }
            self.silence_run += 1;
            self.mono.fill(0);
        } else {
            if got < self.mono.len() {
                self.padded_periods += 1;
                log::warn!(
                    "output: underrun, padded {} of {} frames with silence",
                    self.mono.len() - got,
                    self.mono.len()
                );
                self.mono[got..].fill(0);
            }
            self.silence_run = 0;
        }

        self.expand();
        self.play(running)
    }

    fn rearm(&mut self) -> Result<(), TransferFault> {
        match self.stream.as_mut() {
            Some(stream) => stream.prepare(),
            None => Err(TransferFault::Other("playback stream not open".into())),
        }
    }

    fn on_stop(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            match stream.drain() {
                Ok(()) => log::debug!("output: drained"),
                Err(e) => log::warn!("output: drain failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedDriver;

    fn config(output_channels: u16) -> BeamformerConfig {
        let mut config = BeamformerConfig::default();
        config.audio.frame_size = 4;
        config.audio.output_channels = output_channels;
        config.recovery.prefill_periods = 2;
        config.recovery.max_silence_periods = 2;
        config
    }

    fn endpoint(
        driver: &SimulatedDriver,
        output_channels: u16,
        source: &Arc<SampleChannel>,
    ) -> OutputEndpoint {
        let mut output = OutputEndpoint::new(
            Arc::new(driver.clone()),
            &config(output_channels),
            Arc::clone(source),
        );
        output.open().unwrap();
        output
    }

    #[test]
    fn prefill_then_data() {
        let driver = SimulatedDriver::new();
        let source = Arc::new(SampleChannel::new(64));
        let mut output = endpoint(&driver, 1, &source);
        let running = AtomicBool::new(true);

        output.on_start(&running);
        assert_eq!(driver.played(), vec![0; 8]);

        source.write(&[1, 2, 3, 4]);
        assert!(matches!(output.step(&running), Step::Continue));
        assert_eq!(&driver.played()[8..], &[1, 2, 3, 4]);
    }

    #[test]
    fn short_period_is_padded() {
        let driver = SimulatedDriver::new();
        let source = Arc::new(SampleChannel::new(64));
        let mut output = endpoint(&driver, 1, &source);
        let running = AtomicBool::new(true);

        source.write(&[7, 7]);
        assert!(matches!(output.step(&running), Step::Continue));
        assert_eq!(driver.played(), vec![7, 7, 0, 0]);
        assert_eq!(output.padded_periods(), 1);
    }

    #[test]
    fn mono_is_duplicated_across_channels() {
        let driver = SimulatedDriver::new();
        let source = Arc::new(SampleChannel::new(64));
        let mut output = endpoint(&driver, 2, &source);
        let running = AtomicBool::new(true);

        source.write(&[1, 2, 3, 4]);
        output.step(&running);
        assert_eq!(driver.played(), vec![1, 1, 2, 2, 3, 3, 4, 4]);
    }

    #[test]
    fn silence_padding_is_bounded_then_closed_exits() {
        let driver = SimulatedDriver::new();
        let source = Arc::new(SampleChannel::new(64));
        let mut output = endpoint(&driver, 1, &source);
        let running = AtomicBool::new(true);

        assert!(matches!(output.step(&running), Step::Continue));
        assert!(matches!(output.step(&running), Step::Continue));
        assert!(matches!(output.step(&running), Step::Idle));
        assert_eq!(driver.played().len(), 8);

        source.close();
        assert!(matches!(output.step(&running), Step::Exit));
    }

    #[test]
    fn drains_on_stop() {
        let driver = SimulatedDriver::new();
        let source = Arc::new(SampleChannel::new(64));
        let mut output = endpoint(&driver, 1, &source);
        output.on_stop();
        assert_eq!(driver.drain_count(), 1);
    }
}
