//! Stateful linear resampling between 8 kHz and 16 kHz PCM16.
//!
//! Each direction carries just enough state across calls that chunking the
//! input differently (e.g. one 320-byte call vs. two 160-byte calls)
//! produces the same output stream, modulo the trailing partial sample at
//! the very end of the stream. No direct teacher precedent exists for this
//! DSP; the state shape (a carried "last sample" plus a carried fractional
//! phase) follows directly from the continuity requirement in spec §4.2.
//!
//! A chunk whose byte length is odd cannot be split into whole PCM16
//! samples; `process` rejects it with `ResampleError::MalformedInput`
//! rather than silently truncating, and leaves carried state untouched so
//! the next well-formed chunk continues correctly. Callers pass the frame
//! through unresampled and count the failure (spec §4.2's failure
//! semantics), handled in `Session::resample_inbound`/`prepare_outbound`.

use crate::error::ResampleError;

/// Upsamples 8 kHz PCM16 to 16 kHz by linear interpolation between
/// consecutive input samples, one interpolated sample inserted between
/// each pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct Upsampler8to16 {
    /// Last sample of the previous call, used as the left endpoint of the
    /// interpolation across the chunk boundary. `None` until the first
    /// sample has ever been seen.
    last_sample: Option<i16>,
}

impl Upsampler8to16 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Converts an 8 kHz PCM16 little-endian frame into a 16 kHz PCM16
    /// little-endian frame at twice the sample count. An empty input
    /// yields empty output without consuming or resetting state.
    ///
    /// Returns `ResampleError::MalformedInput` without touching state if
    /// `pcm8k` is not a whole number of 16-bit samples.
    pub fn process(&mut self, pcm8k: &[u8]) -> Result<Vec<u8>, ResampleError> {
        if pcm8k.len() % 2 != 0 {
            return Err(ResampleError::MalformedInput);
        }

        let samples = to_i16_samples(pcm8k);
        if samples.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(samples.len() * 2 * 2);
        let mut prev = self.last_sample.unwrap_or(samples[0]);

        for &sample in &samples {
            let mid = interpolate_mid(prev, sample);
            out.extend_from_slice(&mid.to_le_bytes());
            out.extend_from_slice(&sample.to_le_bytes());
            prev = sample;
        }

        self.last_sample = Some(prev);
        Ok(out)
    }
}

/// Downsamples 16 kHz PCM16 to 8 kHz by decimation with linear
/// interpolation across the odd/even boundary, carrying a fractional
/// "phase" (whether the next output sample starts on an even or odd input
/// index) across calls so an odd-length input chunk doesn't desynchronize
/// the 2:1 ratio on the next call.
#[derive(Debug, Clone, Copy, Default)]
pub struct Downsampler16to8 {
    /// Carried sample when an input chunk ends on an odd total sample
    /// count: the leftover sample is folded into the first output sample
    /// of the next call instead of being dropped.
    pending: Option<i16>,
}

impl Downsampler16to8 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Converts a 16 kHz PCM16 little-endian frame into an 8 kHz PCM16
    /// little-endian frame at half the sample count (rounded down once
    /// any carried pending sample is accounted for).
    ///
    /// Returns `ResampleError::MalformedInput` without touching state if
    /// `pcm16k` is not a whole number of 16-bit samples.
    pub fn process(&mut self, pcm16k: &[u8]) -> Result<Vec<u8>, ResampleError> {
        if pcm16k.len() % 2 != 0 {
            return Err(ResampleError::MalformedInput);
        }

        let mut samples = to_i16_samples(pcm16k);
        if samples.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(pending) = self.pending.take() {
            samples.insert(0, pending);
        }

        let mut out = Vec::with_capacity(samples.len());
        let mut chunks = samples.chunks_exact(2);
        for pair in &mut chunks {
            let avg = average(pair[0], pair[1]);
            out.extend_from_slice(&avg.to_le_bytes());
        }

        if let [leftover] = chunks.remainder() {
            self.pending = Some(*leftover);
        }

        Ok(out)
    }
}

fn interpolate_mid(a: i16, b: i16) -> i16 {
    ((a as i32 + b as i32) / 2) as i16
}

fn average(a: i16, b: i16) -> i16 {
    interpolate_mid(a, b)
}

fn to_i16_samples(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}
