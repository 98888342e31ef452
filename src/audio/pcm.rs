//! PCM conversions and linear resampling.
//!
//! Floating samples are normalized to [-1, 1]. Integer samples are 16-bit
//! signed, packed little-endian on the wire.

use std::borrow::Cow;

/// Convert normalized float samples to PCM16.
///
/// Negative values scale by 32768 and non-negative values by 32767, so +1.0
/// cannot overflow while -1.0 still reaches `i16::MIN`. Out-of-range input
/// is clamped; the cast truncates toward zero.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| sample_to_pcm16(s)).collect()
}

#[inline]
pub(crate) fn sample_to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Convert PCM16 samples to normalized floats.
pub fn pcm16_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| sample_to_float(s)).collect()
}

#[inline]
pub(crate) fn sample_to_float(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// A trailing odd byte is ignored.
pub fn le_bytes_to_pcm16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Linearly resample `samples` from `in_rate` to `out_rate`.
///
/// The output holds `floor(len * out_rate / in_rate)` samples (at least one).
/// Output sample `i` is interpolated at input position `i * in_rate / out_rate`,
/// with the last input sample repeated past the end. Equal rates return the
/// input unchanged without copying.
pub fn resample_linear(samples: &[f32], in_rate: u32, out_rate: u32) -> Cow<'_, [f32]> {
    if in_rate == out_rate || samples.is_empty() || in_rate == 0 || out_rate == 0 {
        return Cow::Borrowed(samples);
    }

    let out_len = ((samples.len() as u64 * u64::from(out_rate)) / u64::from(in_rate)).max(1) as usize;
    let step = f64::from(in_rate) / f64::from(out_rate);
    let last = samples.len() - 1;

    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * step;
        let idx = (pos.floor() as usize).min(last);
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx];
        let b = samples[(idx + 1).min(last)];
        out.push(a + (b - a) * frac);
    }
    Cow::Owned(out)
}
