//! In-process PCM driver with scripted behaviour.
//!
//! [`SimulatedDriver`] stands in for real hardware in tests and in the
//! binary's `--simulate` mode.  Capture streams synthesise a sine tone that
//! reaches microphone `c` `c × channel_delay` samples after microphone 0, so a
//! DOA estimator has something to find.  Playback streams append to a shared,
//! bounded sink.
//!
//! Faults are scripted per direction: each queued fault is returned by the
//! next transfer and sticks until the stream is prepared (or resumed, for a
//! suspend), mirroring how real PCM devices behave.
//!
//! ```
//! use mic_beamformer::device::{SimulatedDriver, ToneSpec, TransferFault};
//!
//! let driver = SimulatedDriver::new().with_tone(ToneSpec {
//!     frequency_hz: 500.0,
//!     amplitude: 4000.0,
//!     channel_delay: 3.0,
//! });
//! driver.inject_capture_fault(TransferFault::Overrun);
//! assert_eq!(driver.prepare_count(), 0);
//! ```

use std::collections::VecDeque;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use super::driver::{
    CaptureStream, DeviceError, Direction, PcmDriver, PcmStream, PlaybackStream, ResumeError,
    StreamParams, TransferFault,
};
use crate::audio::saturate_i16;

/// Poll interval while a capture stall is active.
const STALL_SLICE: Duration = Duration::from_millis(10);

/// Synthetic capture signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneSpec {
    pub frequency_hz: f32,
    pub amplitude: f32,
    /// Extra samples of delay per microphone index.
    pub channel_delay: f32,
}

impl Default for ToneSpec {
    fn default() -> Self {
        Self {
            frequency_hz: 440.0,
            amplitude: 8_000.0,
            channel_delay: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared script state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Script {
    capture_faults: Mutex<VecDeque<TransferFault>>,
    playback_faults: Mutex<VecDeque<TransferFault>>,
    resume: Mutex<VecDeque<Result<(), ResumeError>>>,
    prepare: Mutex<VecDeque<Result<(), TransferFault>>>,
    fail_open: Mutex<Option<Direction>>,
    stall_capture: AtomicBool,
    sink: Mutex<VecDeque<i16>>,
    capture_reads: AtomicU64,
    playback_writes: AtomicU64,
    prepares: AtomicU64,
    resumes: AtomicU64,
    drains: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// SimulatedDriver
// ---------------------------------------------------------------------------

/// Scripted software driver.  Clones share scripts and the playback sink.
#[derive(Clone)]
pub struct SimulatedDriver {
    tone: ToneSpec,
    realtime: bool,
    sink_limit: usize,
    script: Arc<Script>,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self {
            tone: ToneSpec::default(),
            realtime: false,
            sink_limit: 1 << 20,
            script: Arc::new(Script::default()),
        }
    }

    pub fn with_tone(mut self, tone: ToneSpec) -> Self {
        self.tone = tone;
        self
    }

    /// Pace transfers at the stream's sample rate instead of running flat out.
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Samples kept in the playback sink; older samples are discarded.
    pub fn sink_limit(mut self, samples: usize) -> Self {
        self.sink_limit = samples.max(1);
        self
    }

    // -----------------------------------------------------------------------
    // Scripting
    // -----------------------------------------------------------------------

    /// The next capture transfer fails with `fault`.
    pub fn inject_capture_fault(&self, fault: TransferFault) {
        lock(&self.script.capture_faults).push_back(fault);
    }

    /// The next playback transfer fails with `fault`.
    pub fn inject_playback_fault(&self, fault: TransferFault) {
        lock(&self.script.playback_faults).push_back(fault);
    }

    /// Results for upcoming `resume()` calls; unscripted calls succeed.
    pub fn script_resume(&self, results: impl IntoIterator<Item = Result<(), ResumeError>>) {
        lock(&self.script.resume).extend(results);
    }

    /// Results for upcoming `prepare()` calls; unscripted calls succeed.
    pub fn script_prepare(&self, results: impl IntoIterator<Item = Result<(), TransferFault>>) {
        lock(&self.script.prepare).extend(results);
    }

    /// Make opening streams of `direction` fail.
    pub fn fail_open(&self, direction: Direction) {
        *lock(&self.script.fail_open) = Some(direction);
    }

    /// While set, capture reads deliver no data.
    pub fn stall_capture(&self, stalled: bool) {
        self.script.stall_capture.store(stalled, Ordering::Release);
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Copy of everything played so far (up to the sink limit).
    pub fn played(&self) -> Vec<i16> {
        lock(&self.script.sink).iter().copied().collect()
    }

    pub fn capture_reads(&self) -> u64 {
        self.script.capture_reads.load(Ordering::Acquire)
    }

    pub fn playback_writes(&self) -> u64 {
        self.script.playback_writes.load(Ordering::Acquire)
    }

    pub fn prepare_count(&self) -> u64 {
        self.script.prepares.load(Ordering::Acquire)
    }

    pub fn resume_count(&self) -> u64 {
        self.script.resumes.load(Ordering::Acquire)
    }

    pub fn drain_count(&self) -> u64 {
        self.script.drains.load(Ordering::Acquire)
    }

    fn check_open(&self, direction: Direction, params: &StreamParams) -> Result<(), DeviceError> {
        if *lock(&self.script.fail_open) == Some(direction) {
            return Err(DeviceError::NotFound {
                direction,
                device: params.device.clone(),
            });
        }
        if params.channels == 0 || params.sample_rate == 0 || params.period_frames == 0 {
            return Err(DeviceError::Configure {
                direction,
                device: params.device.clone(),
                reason: "zero channels, rate or period".into(),
            });
        }
        Ok(())
    }
}

impl PcmDriver for SimulatedDriver {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn open_capture(&self, params: &StreamParams) -> Result<Box<dyn CaptureStream>, DeviceError> {
        self.check_open(Direction::Capture, params)?;
        Ok(Box::new(SimStream {
            core: StreamCore::new(self, params, Direction::Capture),
            tone: self.tone,
            position: 0,
        }))
    }

    fn open_playback(
        &self,
        params: &StreamParams,
    ) -> Result<Box<dyn PlaybackStream>, DeviceError> {
        self.check_open(Direction::Playback, params)?;
        Ok(Box::new(SimStream {
            core: StreamCore::new(self, params, Direction::Playback),
            tone: self.tone,
            position: 0,
        }))
    }
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

struct StreamCore {
    params: StreamParams,
    direction: Direction,
    script: Arc<Script>,
    realtime: bool,
    sink_limit: usize,
    faulted: Option<TransferFault>,
    clock_start: Instant,
    clock_frames: u64,
}

impl StreamCore {
    fn new(driver: &SimulatedDriver, params: &StreamParams, direction: Direction) -> Self {
        Self {
            params: params.clone(),
            direction,
            script: Arc::clone(&driver.script),
            realtime: driver.realtime,
            sink_limit: driver.sink_limit,
            faulted: None,
            clock_start: Instant::now(),
            clock_frames: 0,
        }
    }

    /// Sticky fault first, then any newly scripted one.
    fn pending_fault(&mut self) -> Result<(), TransferFault> {
        if let Some(fault) = &self.faulted {
            return Err(fault.clone());
        }
        let queue = match self.direction {
            Direction::Capture => &self.script.capture_faults,
            Direction::Playback => &self.script.playback_faults,
        };
        if let Some(fault) = lock(queue).pop_front() {
            self.faulted = Some(fault.clone());
            return Err(fault);
        }
        Ok(())
    }

    fn pace(&mut self, frames: usize) {
        self.clock_frames += frames as u64;
        if !self.realtime {
            return;
        }
        let due = self.clock_start
            + Duration::from_secs_f64(self.clock_frames as f64 / f64::from(self.params.sample_rate));
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }
    }

    fn reset_clock(&mut self) {
        self.clock_start = Instant::now();
        self.clock_frames = 0;
    }
}

struct SimStream {
    core: StreamCore,
    tone: ToneSpec,
    position: u64,
}

impl PcmStream for SimStream {
    fn params(&self) -> &StreamParams {
        &self.core.params
    }

    fn prepare(&mut self) -> Result<(), TransferFault> {
        self.core.script.prepares.fetch_add(1, Ordering::AcqRel);
        lock(&self.core.script.prepare).pop_front().unwrap_or(Ok(()))?;
        self.core.faulted = None;
        self.core.reset_clock();
        Ok(())
    }

    fn resume(&mut self) -> Result<(), ResumeError> {
        self.core.script.resumes.fetch_add(1, Ordering::AcqRel);
        lock(&self.core.script.resume).pop_front().unwrap_or(Ok(()))?;
        if self.core.faulted == Some(TransferFault::Suspended) {
            self.core.faulted = None;
            self.core.reset_clock();
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<(), TransferFault> {
        if self.core.direction == Direction::Playback {
            self.core.script.drains.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }
}

impl CaptureStream for SimStream {
    fn read_frames(&mut self, buf: &mut [i16]) -> Result<usize, TransferFault> {
        self.core.script.capture_reads.fetch_add(1, Ordering::AcqRel);
        self.core.pending_fault()?;

        if self.core.script.stall_capture.load(Ordering::Acquire) {
            thread::sleep(STALL_SLICE);
            return Ok(0);
        }

        let channels = usize::from(self.core.params.channels);
        let frames = buf.len() / channels;
        let rate = f64::from(self.core.params.sample_rate);
        let step = TAU * f64::from(self.tone.frequency_hz) / rate;
        let amplitude = f64::from(self.tone.amplitude);

        for (i, frame) in buf.chunks_exact_mut(channels).enumerate() {
            let t = (self.position + i as u64) as f64;
            for (c, slot) in frame.iter_mut().enumerate() {
                let lag = c as f64 * f64::from(self.tone.channel_delay);
                *slot = saturate_i16((amplitude * ((t - lag) * step).sin()) as f32);
            }
        }
        self.position += frames as u64;
        self.core.pace(frames);
        Ok(frames)
    }
}

impl PlaybackStream for SimStream {
    fn write_frames(&mut self, buf: &[i16]) -> Result<usize, TransferFault> {
        self.core.script.playback_writes.fetch_add(1, Ordering::AcqRel);
        self.core.pending_fault()?;

        let frames = buf.len() / usize::from(self.core.params.channels);
        {
            let mut sink = lock(&self.core.script.sink);
            sink.extend(buf.iter().copied());
            let excess = sink.len().saturating_sub(self.core.sink_limit);
            sink.drain(..excess);
        }
        self.position += frames as u64;
        self.core.pace(frames);
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(channels: u16) -> StreamParams {
        StreamParams {
            device: "sim".into(),
            sample_rate: 32_000,
            channels,
            period_frames: 64,
        }
    }

    #[test]
    fn tone_channels_are_offset() {
        let driver = SimulatedDriver::new().with_tone(ToneSpec {
            frequency_hz: 1000.0,
            amplitude: 10_000.0,
            channel_delay: 4.0,
        });
        let mut stream = driver.open_capture(&params(2)).unwrap();
        let mut buf = vec![0_i16; 128];
        assert_eq!(stream.read_frames(&mut buf).unwrap(), 64);

        // channel 1 at frame i equals channel 0 at frame i - 4
        for i in 4..64 {
            assert_eq!(buf[i * 2 + 1], buf[(i - 4) * 2], "frame {i}");
        }
        assert!(buf.iter().any(|&s| s != 0));
    }

    #[test]
    fn faults_stick_until_prepare() {
        let driver = SimulatedDriver::new();
        let mut stream = driver.open_capture(&params(2)).unwrap();
        let mut buf = vec![0_i16; 128];

        driver.inject_capture_fault(TransferFault::Overrun);
        assert_eq!(stream.read_frames(&mut buf), Err(TransferFault::Overrun));
        assert_eq!(stream.read_frames(&mut buf), Err(TransferFault::Overrun));
        stream.prepare().unwrap();
        assert_eq!(stream.read_frames(&mut buf), Ok(64));
        assert_eq!(driver.prepare_count(), 1);
        assert_eq!(driver.capture_reads(), 3);
    }

    #[test]
    fn resume_clears_suspend() {
        let driver = SimulatedDriver::new();
        let mut stream = driver.open_playback(&params(1)).unwrap();
        driver.inject_playback_fault(TransferFault::Suspended);
        driver.script_resume([Err(ResumeError::TryAgain)]);

        assert_eq!(stream.write_frames(&[0; 64]), Err(TransferFault::Suspended));
        assert_eq!(stream.resume(), Err(ResumeError::TryAgain));
        assert_eq!(stream.resume(), Ok(()));
        assert_eq!(stream.write_frames(&[1; 64]), Ok(64));
        assert_eq!(driver.resume_count(), 2);
    }

    #[test]
    fn scripted_prepare_failure() {
        let driver = SimulatedDriver::new();
        let mut stream = driver.open_capture(&params(1)).unwrap();
        driver.script_prepare([Err(TransferFault::Other("gone".into()))]);
        assert!(stream.prepare().is_err());
        assert!(stream.prepare().is_ok());
    }

    #[test]
    fn sink_keeps_the_newest_samples() {
        let driver = SimulatedDriver::new().sink_limit(100);
        let mut stream = driver.open_playback(&params(1)).unwrap();
        for v in 0..3_i16 {
            stream.write_frames(&[v; 64]).unwrap();
        }
        let played = driver.played();
        assert_eq!(played.len(), 100);
        assert_eq!(*played.last().unwrap(), 2);
        assert_eq!(driver.playback_writes(), 3);
        stream.drain().unwrap();
        assert_eq!(driver.drain_count(), 1);
    }

    #[test]
    fn open_failures() {
        let driver = SimulatedDriver::new();
        driver.fail_open(Direction::Playback);
        assert!(driver.open_capture(&params(2)).is_ok());
        assert!(matches!(
            driver.open_playback(&params(1)),
            Err(DeviceError::NotFound { .. })
        ));
        assert!(matches!(
            driver.open_capture(&params(0)),
            Err(DeviceError::Configure { .. })
        ));
    }

    #[test]
    fn realtime_paces_reads() {
        let driver = SimulatedDriver::new().realtime(true);
        let mut stream = driver.open_capture(&params(1)).unwrap();
        let mut buf = vec![0_i16; 320];
        let start = Instant::now();
        for _ in 0..5 {
            stream.read_frames(&mut buf).unwrap();
        }
        // 5 × 320 frames at 32 kHz = 50 ms
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn stalled_capture_returns_nothing() {
        let driver = SimulatedDriver::new();
        let mut stream = driver.open_capture(&params(1)).unwrap();
        driver.stall_capture(true);
        let mut buf = vec![0_i16; 64];
        assert_eq!(stream.read_frames(&mut buf), Ok(0));
        driver.stall_capture(false);
        assert_eq!(stream.read_frames(&mut buf), Ok(64));
    }
}
