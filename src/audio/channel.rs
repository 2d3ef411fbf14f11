//! Bounded, blocking sample channel between pipeline stages.
//!
//! [`SampleChannel`] is a fixed-capacity ring of `i16` samples guarded by a
//! mutex and two condition variables.  The capacity must be a power of two so
//! positions wrap with a mask; one slot is always left empty to tell "full"
//! from "empty", so at most `capacity - 1` samples are ever buffered.
//!
//! Every blocking wait is sliced into [`WAIT_SLICE`] intervals, so a
//! [`close`](SampleChannel::close) is observed within a bounded delay even if
//! a wake-up is missed.
//!
//! # Example
//!
//! ```rust
//! use mic_beamformer::audio::SampleChannel;
//!
//! let channel = SampleChannel::new(8);
//! assert_eq!(channel.write(&[1, 2, 3]), 3);
//! channel.close();
//!
//! let mut out = [0_i16; 8];
//! assert_eq!(channel.read(&mut out), 3);
//! assert_eq!(&out[..3], &[1, 2, 3]);
//! assert_eq!(channel.read(&mut out), 0);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Longest single wait inside a blocking call before flags are re-checked.
pub const WAIT_SLICE: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Ring
// ---------------------------------------------------------------------------

struct Ring {
    buf: Vec<i16>,
    read_pos: usize,
    write_pos: usize,
    mask: usize,
}

impl Ring {
    fn available(&self) -> usize {
        self.write_pos.wrapping_sub(self.read_pos) & self.mask
    }

    fn free(&self) -> usize {
        self.mask - self.available()
    }

    fn push(&mut self, data: &[i16]) {
        for (i, &sample) in data.iter().enumerate() {
            self.buf[(self.write_pos + i) & self.mask] = sample;
        }
        self.write_pos = (self.write_pos + data.len()) & self.mask;
    }

    fn pop(&mut self, out: &mut [i16]) {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.buf[(self.read_pos + i) & self.mask];
        }
        self.read_pos = (self.read_pos + out.len()) & self.mask;
    }
}

// ---------------------------------------------------------------------------
// SampleChannel
// ---------------------------------------------------------------------------

/// Fixed-capacity blocking queue of PCM samples with explicit close.
///
/// Safe to share between threads behind an `Arc`.  In the pipeline each
/// instance has exactly one producer and one consumer.
pub struct SampleChannel {
    ring: Mutex<Ring>,
    not_empty: Condvar,
    not_full: Condvar,
    closed: AtomicBool,
    capacity: usize,
}

impl SampleChannel {
    /// Create a channel with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two or is smaller than 2.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity >= 2 && capacity.is_power_of_two(),
            "SampleChannel capacity must be a power of two >= 2"
        );
        Self {
            ring: Mutex::new(Ring {
                buf: vec![0; capacity],
                read_pos: 0,
                write_pos: 0,
                mask: capacity - 1,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            closed: AtomicBool::new(false),
            capacity,
        }
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    /// Write all of `samples`, blocking while the channel is full.
    ///
    /// Returns fewer than `samples.len()` only if the channel was closed
    /// mid-write.  Returns `0` immediately on a closed channel.
    pub fn write(&self, samples: &[i16]) -> usize {
        self.write_until(samples, None)
    }

    /// Like [`write`](Self::write) but gives up once `timeout` has elapsed.
    ///
    /// The short count is the number of samples that made it in; the caller
    /// decides whether the rest counts as dropped.
    pub fn write_timeout(&self, samples: &[i16], timeout: Duration) -> usize {
        self.write_until(samples, Some(Instant::now() + timeout))
    }

    fn write_until(&self, samples: &[i16], deadline: Option<Instant>) -> usize {
        if self.is_closed() {
            return 0;
        }

        let mut ring = self.lock();
        let mut written = 0;

        while written < samples.len() && !self.is_closed() {
            let free = ring.free();
            if free == 0 {
                let Some(wait) = Self::next_wait(deadline) else {
                    break;
                };
                ring = self
                    .not_full
                    .wait_timeout(ring, wait)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                continue;
            }

            let n = free.min(samples.len() - written);
            ring.push(&samples[written..written + n]);
            written += n;
            self.not_empty.notify_one();
        }

        written
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    /// Fill `out`, blocking while the channel is empty and open.
    ///
    /// Returns a short count only when the channel is closed and drained.
    /// Use [`is_closed`](Self::is_closed) to tell the two cases apart.
    pub fn read(&self, out: &mut [i16]) -> usize {
        self.read_until(out, None)
    }

    /// Like [`read`](Self::read) but returns whatever arrived once `timeout`
    /// has elapsed.
    pub fn read_timeout(&self, out: &mut [i16], timeout: Duration) -> usize {
        self.read_until(out, Some(Instant::now() + timeout))
    }

    /// All-or-nothing read of one frame.
    ///
    /// While the channel is open this waits up to `timeout` for `out.len()`
    /// samples and then takes them in one step, or takes nothing.  Once the
    /// channel is closed the remaining samples (possibly fewer than
    /// `out.len()`) are returned.
    ///
    /// # Panics
    ///
    /// Panics if `out` is larger than the channel can ever hold.
    pub fn read_exact_timeout(&self, out: &mut [i16], timeout: Duration) -> usize {
        assert!(
            out.len() < self.capacity,
            "frame of {} samples can never fit a channel of capacity {}",
            out.len(),
            self.capacity
        );

        let deadline = Some(Instant::now() + timeout);
        let mut ring = self.lock();

        loop {
            let available = ring.available();
            if available >= out.len() {
                ring.pop(out);
                self.not_full.notify_one();
                return out.len();
            }
            if self.is_closed() {
                ring.pop(&mut out[..available]);
                self.not_full.notify_one();
                return available;
            }
            let Some(wait) = Self::next_wait(deadline) else {
                return 0;
            };
            ring = self
                .not_empty
                .wait_timeout(ring, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn read_until(&self, out: &mut [i16], deadline: Option<Instant>) -> usize {
        let mut ring = self.lock();
        let mut read = 0;

        while read < out.len() {
            let available = ring.available();
            if available == 0 {
                if self.is_closed() {
                    break;
                }
                let Some(wait) = Self::next_wait(deadline) else {
                    break;
                };
                ring = self
                    .not_empty
                    .wait_timeout(ring, wait)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                continue;
            }

            let n = available.min(out.len() - read);
            ring.pop(&mut out[read..read + n]);
            read += n;
            self.not_full.notify_one();
        }

        read
    }

    // -----------------------------------------------------------------------
    // Lifecycle / queries
    // -----------------------------------------------------------------------

    /// Close the channel and wake every blocked reader and writer.
    /// Idempotent.
    pub fn close(&self) {
        let _ring = self.lock();
        self.closed.store(true, Ordering::Release);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// `true` once [`close`](Self::close) ran.  Buffered samples may still be
    /// readable.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Samples currently buffered (always `<= capacity - 1`).
    pub fn available(&self) -> usize {
        self.lock().available()
    }

    /// Samples that can be written without blocking.
    pub fn free(&self) -> usize {
        self.lock().free()
    }

    /// Ring size in samples; one slot is always kept free.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Length of the next wait slice, or `None` once the deadline has passed.
    fn next_wait(deadline: Option<Instant>) -> Option<Duration> {
        match deadline {
            None => Some(WAIT_SLICE),
            Some(deadline) => {
                let now = Instant::now();
                (now < deadline).then(|| (deadline - now).min(WAIT_SLICE))
            }
        }
    }
}

impl Drop for SampleChannel {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
