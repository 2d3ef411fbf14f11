//! Per-channel integer delay lines and the compensation step built on them.

use crate::audio::extract_channel;

/// Circular history that returns the sample pushed `delay` calls ago.
///
/// Holds `2 * max_delay + 1` samples so any relative compensation between
/// two channels of a steering table clamped to `±max_delay` fits.
#[derive(Debug, Clone)]
pub struct DelayLine {
    buf: Vec<f32>,
    pos: usize,
}

impl DelayLine {
    pub fn new(max_delay: usize) -> Self {
        Self {
            buf: vec![0.0; 2 * max_delay + 1],
            pos: 0,
        }
    }

    /// Longest delay this line can apply.
    pub fn max_delay(&self) -> usize {
        self.buf.len() - 1
    }

    /// Push `sample` and return the sample from `delay` pushes ago.
    ///
    /// Delays beyond [`max_delay`](Self::max_delay) are clamped.
    pub fn process(&mut self, sample: f32, delay: usize) -> f32 {
        let len = self.buf.len();
        let delay = delay.min(len - 1);
        self.buf[self.pos] = sample;
        let out = self.buf[(self.pos + len - delay) % len];
        self.pos = (self.pos + 1) % len;
        out
    }

    /// Zero the history.
    pub fn reset(&mut self) {
        self.buf.fill(0.0);
        self.pos = 0;
    }
}

// ---------------------------------------------------------------------------
// DelayCompensator
// ---------------------------------------------------------------------------

/// Time-aligns the channels of an interleaved frame for one steering angle.
///
/// Channel `c` is delayed by `max(delays) - delays[c]` whole samples so the
/// latest-arriving channel defines the alignment point.  The part of the
/// exact delay that integer shifting cannot express is kept per channel as a
/// residual (in samples, within ±0.5) for the frequency-domain combiner.
pub struct DelayCompensator {
    lines: Vec<DelayLine>,
    aligned: Vec<Vec<f32>>,
    residual: Vec<f32>,
    scratch: Vec<f32>,
}

impl DelayCompensator {
    pub fn new(channels: usize, max_delay: usize, frame_size: usize) -> Self {
        Self {
            lines: (0..channels).map(|_| DelayLine::new(max_delay)).collect(),
            aligned: vec![vec![0.0; frame_size]; channels],
            residual: vec![0.0; channels],
            scratch: vec![0.0; frame_size],
        }
    }

    pub fn channels(&self) -> usize {
        self.lines.len()
    }

    /// Align every channel of `frame`.
    ///
    /// `delays` and `exact` are the integer and fractional per-channel
    /// delays from the steering table; both must have one entry per channel.
    pub fn align(&mut self, frame: &[i16], delays: &[i32], exact: &[f32]) {
        let channels = self.lines.len();
        let n = frame.len() / channels.max(1);
        let latest = delays.iter().copied().max().unwrap_or(0);

        self.scratch.resize(n, 0.0);
        for (c, line) in self.lines.iter_mut().enumerate() {
            let shift = usize::try_from(latest - delays[c]).unwrap_or(0);
            extract_channel(frame, channels, c, &mut self.scratch);

            let out = &mut self.aligned[c];
            out.resize(n, 0.0);
            for (slot, &x) in out.iter_mut().zip(self.scratch.iter()) {
                *slot = line.process(x, shift);
            }
            self.residual[c] = delays[c] as f32 - exact[c];
        }
    }

    /// Channels produced by the last [`align`](Self::align) call.
    pub fn aligned(&self) -> &[Vec<f32>] {
        &self.aligned
    }

    /// Fractional residual delay per channel from the last call.
    pub fn residual(&self) -> &[f32] {
        &self.residual
    }

    pub fn reset(&mut self) {
        self.lines.iter_mut().for_each(DelayLine::reset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::interleave;

    #[test]
    fn zero_delay_passes_through() {
        let mut line = DelayLine::new(4);
        for x in [1.0, -2.0, 3.5] {
            assert_eq!(line.process(x, 0), x);
        }
    }

    #[test]
    fn delays_by_the_requested_amount() {
        let mut line = DelayLine::new(2);
        let out: Vec<f32> = (1..=6).map(|x| line.process(x as f32, 3)).collect();
        assert_eq!(out, vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn oversized_delay_is_clamped() {
        let mut line = DelayLine::new(1);
        assert_eq!(line.max_delay(), 2);
        let out: Vec<f32> = (1..=4).map(|x| line.process(x as f32, 10)).collect();
        assert_eq!(out, vec![0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn reset_clears_history() {
        let mut line = DelayLine::new(2);
        line.process(9.0, 1);
        line.reset();
        assert_eq!(line.process(1.0, 1), 0.0);
    }

    #[test]
    fn compensator_aligns_a_lagging_channel() {
        // channel 1 hears the impulse two samples after channel 0
        let ch0 = vec![0, 100, 0, 0, 0, 0];
        let ch1 = vec![0, 0, 0, 100, 0, 0];
        let frame = interleave(&[ch0, ch1]);

        let mut comp = DelayCompensator::new(2, 4, 6);
        comp.align(&frame, &[0, 2], &[0.0, 2.25]);

        let aligned = comp.aligned();
        assert_eq!(aligned[0], vec![0.0, 0.0, 0.0, 100.0, 0.0, 0.0]);
        assert_eq!(aligned[1], vec![0.0, 0.0, 0.0, 100.0, 0.0, 0.0]);
        assert_eq!(comp.residual(), &[0.0, -0.25]);
    }

    #[test]
    fn compensator_carries_history_across_frames() {
        let mut comp = DelayCompensator::new(2, 2, 2);
        comp.align(&interleave(&[vec![1, 2], vec![0, 0]]), &[-1, 0], &[-1.0, 0.0]);
        assert_eq!(comp.aligned()[0], vec![0.0, 1.0]);
        comp.align(&interleave(&[vec![3, 4], vec![0, 0]]), &[-1, 0], &[-1.0, 0.0]);
        assert_eq!(comp.aligned()[0], vec![2.0, 3.0]);
        assert_eq!(comp.aligned()[1], vec![0.0, 0.0]);
    }
}
