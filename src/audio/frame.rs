//! Helpers for interleaved `i16` PCM frames.
//!
//! Multi-channel frames are interleaved: sample `i` of channel `c` lives at
//! index `i * channels + c`.

/// Copy channel `channel` of an interleaved frame into `out` as `f32`.
///
/// `out.len()` decides how many samples are taken.
pub fn extract_channel(frame: &[i16], channels: usize, channel: usize, out: &mut [f32]) {
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = f32::from(frame[i * channels + channel]);
    }
}

/// Interleave per-channel sample slices into one frame.
///
/// All slices must have the same length.
pub fn interleave(channels: &[Vec<i16>]) -> Vec<i16> {
    let Some(first) = channels.first() else {
        return Vec::new();
    };
    let n = first.len();
    let mut out = Vec::with_capacity(n * channels.len());
    for i in 0..n {
        for channel in channels {
            out.push(channel[i]);
        }
    }
    out
}

/// Largest absolute sample value, saturated to `i16::MAX`.
pub fn peak(samples: &[i16]) -> i16 {
    samples
        .iter()
        .map(|s| s.unsigned_abs())
        .max()
        .map(|p| p.min(i16::MAX as u16) as i16)
        .unwrap_or(0)
}

/// Returns `true` when every sample is exactly zero.
pub fn is_silent(samples: &[i16]) -> bool {
    samples.iter().all(|&s| s == 0)
}

/// Round and clamp an `f32` sample into the `i16` range.
pub fn saturate_i16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    sample
        .round()
        .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}
