//! Real audio hardware through `cpal`.
//!
//! cpal is callback driven while the pipeline expects blocking transfers, so
//! each stream is bridged through a bounded sample queue: the capture
//! callback pushes into it and `read_frames` pops; `write_frames` pushes and
//! the playback callback pops.  Queue overflow on capture is reported as an
//! overrun and starvation on playback (after real data was queued) as an
//! underrun.  Both stick until `prepare()`.
//!
//! `cpal::Stream` is not `Send` on every platform, so the stream is built and
//! kept on a small keeper thread that is commanded over an mpsc channel; the
//! handle given to the stage thread only holds the queue and the sender.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::driver::{
    CaptureStream, DeviceError, Direction, PcmDriver, PcmStream, PlaybackStream, ResumeError,
    StreamParams, TransferFault,
};
use crate::audio::saturate_i16;

/// Periods buffered between the callback and the stage thread.
const QUEUE_PERIODS: usize = 8;

/// Lower bound on how long a transfer waits for the callback.
const MIN_TRANSFER_WAIT: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// CpalDriver
// ---------------------------------------------------------------------------

/// Driver for the platform's default cpal host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDriver;

impl CpalDriver {
    pub fn new() -> Self {
        Self
    }

    /// Names of the input and output devices on the default host.
    pub fn list_devices() -> Result<(Vec<String>, Vec<String>), DeviceError> {
        let host = cpal::default_host();
        let backend = |e: cpal::DevicesError| DeviceError::Backend(e.to_string());
        let inputs = host
            .input_devices()
            .map_err(backend)?
            .filter_map(|d| d.name().ok())
            .collect();
        let outputs = host
            .output_devices()
            .map_err(backend)?
            .filter_map(|d| d.name().ok())
            .collect();
        Ok((inputs, outputs))
    }
}

impl PcmDriver for CpalDriver {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn open_capture(&self, params: &StreamParams) -> Result<Box<dyn CaptureStream>, DeviceError> {
        Ok(Box::new(CpalStream::open(Direction::Capture, params)?))
    }

    fn open_playback(
        &self,
        params: &StreamParams,
    ) -> Result<Box<dyn PlaybackStream>, DeviceError> {
        Ok(Box::new(CpalStream::open(Direction::Playback, params)?))
    }
}

// ---------------------------------------------------------------------------
// SampleQueue
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct QueueState {
    samples: VecDeque<i16>,
    fault: Option<TransferFault>,
    /// Playback only: real samples were queued since the last prepare.
    primed: bool,
}

/// Bounded queue between a cpal callback and a blocking caller.
#[derive(Debug)]
struct SampleQueue {
    state: Mutex<QueueState>,
    changed: Condvar,
    capacity: usize,
}

impl SampleQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                samples: VecDeque::with_capacity(capacity),
                ..QueueState::default()
            }),
            changed: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Capture callback side.
    fn push(&self, samples: impl Iterator<Item = i16>) {
        let mut st = self.lock();
        let mut overflowed = false;
        for sample in samples {
            if st.samples.len() >= self.capacity {
                st.samples.pop_front();
                overflowed = true;
            }
            st.samples.push_back(sample);
        }
        if overflowed && st.fault.is_none() {
            st.fault = Some(TransferFault::Overrun);
        }
        self.changed.notify_all();
    }

    /// Playback callback side.
    fn pull<T: Copy>(&self, out: &mut [T], silence: T, convert: impl Fn(i16) -> T) {
        let mut st = self.lock();
        let mut starved = false;
        for slot in out.iter_mut() {
            *slot = match st.samples.pop_front() {
                Some(sample) => convert(sample),
                None => {
                    starved = true;
                    silence
                }
            };
        }
        if starved && st.primed && st.fault.is_none() {
            st.fault = Some(TransferFault::Underrun);
            st.primed = false;
        }
        self.changed.notify_all();
    }

    fn fail(&self, fault: TransferFault) {
        let mut st = self.lock();
        if st.fault.is_none() {
            st.fault = Some(fault);
        }
        self.changed.notify_all();
    }

    fn reset(&self) {
        let mut st = self.lock();
        st.samples.clear();
        st.fault = None;
        st.primed = false;
        self.changed.notify_all();
    }

    /// Pop up to `out.len()` samples (whole frames only), waiting until
    /// `deadline` for a full buffer.
    fn read(&self, out: &mut [i16], channels: usize, deadline: Instant) -> Result<usize, TransferFault> {
        let mut st = self.lock();
        loop {
            if let Some(fault) = &st.fault {
                return Err(fault.clone());
            }
            if st.samples.len() >= out.len() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            st = self
                .changed
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        let available = st.samples.len().min(out.len());
        let n = available - available % channels.max(1);
        for slot in out[..n].iter_mut() {
            *slot = st.samples.pop_front().unwrap_or(0);
        }
        Ok(n)
    }

    /// Push as much of `data` as fits by `deadline` (whole frames only).
    fn write(&self, data: &[i16], channels: usize, deadline: Instant) -> Result<usize, TransferFault> {
        let mut st = self.lock();
        loop {
            if let Some(fault) = &st.fault {
                return Err(fault.clone());
            }
            if self.capacity - st.samples.len() >= data.len() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            st = self
                .changed
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        let free = (self.capacity - st.samples.len()).min(data.len());
        let n = free - free % channels.max(1);
        st.samples.extend(data[..n].iter().copied());
        if n > 0 {
            st.primed = true;
        }
        Ok(n)
    }

    /// Wait until the callback has consumed everything or `deadline` passes.
    fn drain(&self, deadline: Instant) -> Result<(), TransferFault> {
        let mut st = self.lock();
        while !st.samples.is_empty() {
            if let Some(fault) = &st.fault {
                return Err(fault.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!("cpal: drain timed out with {} samples queued", st.samples.len());
                break;
            }
            st = self
                .changed
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Keeper thread
// ---------------------------------------------------------------------------

enum Command {
    Play,
    Close,
}

/// Owns the `cpal::Stream` on a dedicated thread.
struct Keeper {
    commands: mpsc::Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl Keeper {
    fn spawn(
        direction: Direction,
        params: StreamParams,
        queue: Arc<SampleQueue>,
    ) -> Result<Self, DeviceError> {
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), DeviceError>>(1);
        let (commands, command_rx) = mpsc::channel::<Command>();

        let thread = thread::Builder::new()
            .name(format!("cpal-{direction}"))
            .spawn(move || {
                let stream = match build_stream(direction, &params, queue) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(DeviceError::Backend(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                for command in command_rx {
                    match command {
                        Command::Play => {
                            if let Err(e) = stream.play() {
                                log::warn!("cpal {direction}: restart failed: {e}");
                            }
                        }
                        Command::Close => break,
                    }
                }
                drop(stream);
            })?;

        let setup = ready_rx.recv().unwrap_or_else(|_| {
            Err(DeviceError::Backend(
                "stream thread exited during setup".into(),
            ))
        });
        match setup {
            Ok(()) => Ok(Self {
                commands,
                thread: Some(thread),
            }),
            Err(e) => {
                let _ = thread.join();
                Err(e)
            }
        }
    }

    /// Ask the keeper to (re)start the stream.  Fails once the keeper
    /// thread is gone, which no prepare can fix.
    fn play(&self) -> Result<(), TransferFault> {
        self.commands
            .send(Command::Play)
            .map_err(|_| TransferFault::Other("cpal keeper thread is gone".into()))
    }
}

impl Drop for Keeper {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Close);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("cpal keeper thread panicked");
            }
        }
    }
}

fn find_device(
    host: &cpal::Host,
    direction: Direction,
    id: &str,
) -> Result<cpal::Device, DeviceError> {
    let not_found = || DeviceError::NotFound {
        direction,
        device: id.to_string(),
    };
    let backend = |e: cpal::DevicesError| DeviceError::Backend(e.to_string());
    let named = |d: &cpal::Device| d.name().map(|n| n == id).unwrap_or(false);

    let found = match (direction, id) {
        (Direction::Capture, "default") => host.default_input_device(),
        (Direction::Playback, "default") => host.default_output_device(),
        (Direction::Capture, _) => host.input_devices().map_err(backend)?.find(named),
        (Direction::Playback, _) => host.output_devices().map_err(backend)?.find(named),
    };
    found.ok_or_else(not_found)
}

fn build_stream(
    direction: Direction,
    params: &StreamParams,
    queue: Arc<SampleQueue>,
) -> Result<cpal::Stream, DeviceError> {
    let host = cpal::default_host();
    let device = find_device(&host, direction, &params.device)?;
    let configure = |reason: String| DeviceError::Configure {
        direction,
        device: params.device.clone(),
        reason,
    };

    let supported = match direction {
        Direction::Capture => device.default_input_config(),
        Direction::Playback => device.default_output_config(),
    }
    .map_err(|e| configure(e.to_string()))?;

    let config = cpal::StreamConfig {
        channels: params.channels,
        sample_rate: cpal::SampleRate(params.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let error_queue = Arc::clone(&queue);
    let on_error = move |err: cpal::StreamError| {
        log::error!("cpal stream error: {err}");
        error_queue.fail(TransferFault::Other(err.to_string()));
    };

    let stream = match (direction, supported.sample_format()) {
        (Direction::Capture, cpal::SampleFormat::I16) => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| queue.push(data.iter().copied()),
            on_error,
            None,
        ),
        (Direction::Capture, cpal::SampleFormat::F32) => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                queue.push(data.iter().map(|&s| f32_to_i16(s)))
            },
            on_error,
            None,
        ),
        (Direction::Playback, cpal::SampleFormat::I16) => device.build_output_stream(
            &config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| queue.pull(data, 0, |s| s),
            on_error,
            None,
        ),
        (Direction::Playback, cpal::SampleFormat::F32) => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                queue.pull(data, 0.0, i16_to_f32)
            },
            on_error,
            None,
        ),
        (_, format) => return Err(configure(format!("unsupported sample format {format:?}"))),
    };
    stream.map_err(|e| configure(e.to_string()))
}

fn f32_to_i16(sample: f32) -> i16 {
    saturate_i16(sample * f32::from(i16::MAX))
}

fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / f32::from(i16::MAX)
}

// ---------------------------------------------------------------------------
// CpalStream
// ---------------------------------------------------------------------------

/// Blocking handle over a keeper-owned cpal stream.
struct CpalStream {
    params: StreamParams,
    queue: Arc<SampleQueue>,
    keeper: Keeper,
    transfer_wait: Duration,
}

impl CpalStream {
    fn open(direction: Direction, params: &StreamParams) -> Result<Self, DeviceError> {
        let queue = Arc::new(SampleQueue::new(params.period_samples() * QUEUE_PERIODS));
        let keeper = Keeper::spawn(direction, params.clone(), Arc::clone(&queue))?;
        let period = Duration::from_secs_f64(
            params.period_frames as f64 / f64::from(params.sample_rate.max(1)),
        );
        Ok(Self {
            params: params.clone(),
            queue,
            keeper,
            transfer_wait: (period * 4).max(MIN_TRANSFER_WAIT),
        })
    }

    fn channels(&self) -> usize {
        usize::from(self.params.channels)
    }
}

impl PcmStream for CpalStream {
    fn params(&self) -> &StreamParams {
        &self.params
    }

    fn prepare(&mut self) -> Result<(), TransferFault> {
        self.queue.reset();
        self.keeper.play()
    }

    fn resume(&mut self) -> Result<(), ResumeError> {
        self.keeper
            .play()
            .map_err(|fault| ResumeError::Failed(fault.to_string()))?;
        let mut st = self.queue.lock();
        if st.fault == Some(TransferFault::Suspended) {
            st.fault = None;
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<(), TransferFault> {
        let budget = self.transfer_wait * QUEUE_PERIODS as u32;
        self.queue.drain(Instant::now() + budget)
    }
}

impl CaptureStream for CpalStream {
    fn read_frames(&mut self, buf: &mut [i16]) -> Result<usize, TransferFault> {
        let deadline = Instant::now() + self.transfer_wait;
        let samples = self.queue.read(buf, self.channels(), deadline)?;
        Ok(samples / self.channels().max(1))
    }
}

impl PlaybackStream for CpalStream {
    fn write_frames(&mut self, buf: &[i16]) -> Result<usize, TransferFault> {
        let deadline = Instant::now() + self.transfer_wait;
        let samples = self.queue.write(buf, self.channels(), deadline)?;
        Ok(samples / self.channels().max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(20)
    }

    #[test]
    fn dead_keeper_fails_play() {
        let (commands, command_rx) = mpsc::channel::<Command>();
        drop(command_rx);
        let keeper = Keeper {
            commands,
            thread: None,
        };
        assert!(matches!(keeper.play(), Err(TransferFault::Other(_))));
    }

    #[test]
    fn live_keeper_accepts_play() {
        let (commands, command_rx) = mpsc::channel::<Command>();
        let keeper = Keeper {
            commands,
            thread: None,
        };
        assert_eq!(keeper.play(), Ok(()));
        assert!(matches!(command_rx.try_recv(), Ok(Command::Play)));
    }

    #[test]
    fn capture_overflow_is_an_overrun() {
        let queue = SampleQueue::new(8);
        queue.push((0..12).map(|s| s as i16));
        let mut out = [0_i16; 4];
        assert_eq!(queue.read(&mut out, 2, soon()), Err(TransferFault::Overrun));

        queue.reset();
        queue.push([1, 2, 3, 4].into_iter());
        assert_eq!(queue.read(&mut out, 2, soon()), Ok(4));
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn partial_read_keeps_whole_frames() {
        let queue = SampleQueue::new(16);
        queue.push([1, 2, 3].into_iter());
        let mut out = [0_i16; 8];
        assert_eq!(queue.read(&mut out, 2, soon()), Ok(2));
        assert_eq!(&out[..2], &[1, 2]);
    }

    #[test]
    fn starvation_after_data_is_an_underrun() {
        let queue = SampleQueue::new(16);
        let mut out = [1.0_f32; 4];

        // starving before anything was written is just start-up silence
        queue.pull(&mut out, 0.0, i16_to_f32);
        assert_eq!(out, [0.0; 4]);
        assert_eq!(queue.write(&[100; 4], 1, soon()), Ok(4));

        queue.pull(&mut out, 0.0, i16_to_f32);
        assert!(out.iter().all(|&s| s > 0.0));
        queue.pull(&mut out, 0.0, i16_to_f32);
        assert_eq!(queue.write(&[1; 4], 1, soon()), Err(TransferFault::Underrun));
    }

    #[test]
    fn write_times_out_when_full() {
        let queue = SampleQueue::new(8);
        assert_eq!(queue.write(&[0; 6], 2, soon()), Ok(6));
        assert_eq!(queue.write(&[0; 6], 2, soon()), Ok(2));
    }

    #[test]
    fn sample_conversions() {
        assert_eq!(f32_to_i16(1.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), i16::MIN);
        assert_eq!(f32_to_i16(0.0), 0);
        assert!((i16_to_f32(i16::MAX) - 1.0).abs() < f32::EPSILON);
    }
}
