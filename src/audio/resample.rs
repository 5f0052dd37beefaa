//! Channel downmix and sample-rate conversion
//!
//! Input devices rarely run at the 16kHz the live API expects, and output
//! devices do not always accept 24kHz. Both directions go through rubato's
//! sinc resampler:
//!
//! - [`StreamResampler`] converts a continuous capture stream, one device
//!   callback at a time, keeping filter history across callbacks.
//! - [`BlockResampler`] converts one playback buffer to an exact number of
//!   output frames, so consecutive buffers tile the output clock with no gap.

use std::iter;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// Input frames per rubato chunk on the capture path
const STREAM_CHUNK_FRAMES: usize = 1024;

/// Input frames per rubato chunk on the playback path
const BLOCK_CHUNK_FRAMES: usize = 2048;

/// Source samples of history fed ahead of each playback buffer. Covers half
/// the sinc window.
pub(crate) const LEAD_IN_FRAMES: usize = 256;

#[derive(Debug, Clone)]
pub enum ResampleError {
    Construction(String),
    Process(String),
}

impl std::fmt::Display for ResampleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResampleError::Construction(e) => write!(f, "Failed to create resampler: {}", e),
            ResampleError::Process(e) => write!(f, "Resampling failed: {}", e),
        }
    }
}

impl std::error::Error for ResampleError {}

/// Average interleaved multi-channel samples down to mono
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn sinc_resampler(
    source_rate: u32,
    target_rate: u32,
    chunk_size: usize,
) -> Result<Option<SincFixedIn<f32>>, ResampleError> {
    if source_rate == target_rate {
        return Ok(None);
    }
    if source_rate == 0 || target_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), passing audio through",
            source_rate,
            target_rate
        );
        return Ok(None);
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    SincFixedIn::<f32>::new(
        target_rate as f64 / source_rate as f64,
        2.0,
        params,
        chunk_size,
        1,
    )
    .map(Some)
    .map_err(|e| ResampleError::Construction(e.to_string()))
}

/// Run one chunk through `inner`. A chunk shorter than the resampler wants
/// is zero-padded by rubato.
fn process_chunk(
    inner: &mut SincFixedIn<f32>,
    chunk: &[f32],
    out: &mut Vec<f32>,
) -> Result<(), ResampleError> {
    let wave: [&[f32]; 1] = [chunk];
    let waves = if chunk.len() >= inner.input_frames_next() {
        inner.process(&wave[..], None)
    } else {
        inner.process_partial(Some(&wave[..]), None)
    }
    .map_err(|e| ResampleError::Process(e.to_string()))?;

    if let Some(channel) = waves.first() {
        out.extend_from_slice(channel);
    }
    Ok(())
}

/// Resampler for a continuous mono stream
pub struct StreamResampler {
    source_rate: u32,
    target_rate: u32,
    inner: Option<SincFixedIn<f32>>,
    /// Input waiting for a full chunk
    pending: Vec<f32>,
    /// Warm-up output still to discard
    skip: usize,
}

impl std::fmt::Debug for StreamResampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResampler")
            .field("source_rate", &self.source_rate)
            .field("target_rate", &self.target_rate)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl StreamResampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Result<Self, ResampleError> {
        let inner = sinc_resampler(source_rate, target_rate, STREAM_CHUNK_FRAMES)?;
        let skip = inner.as_ref().map_or(0, |r| r.output_delay());
        Ok(Self {
            source_rate,
            target_rate,
            inner,
            pending: Vec::with_capacity(STREAM_CHUNK_FRAMES * 2),
            skip,
        })
    }

    /// True when input is forwarded untouched
    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Resample one block of mono input, appending whatever output is ready to `out`
    pub fn process_into(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<(), ResampleError> {
        let Some(inner) = self.inner.as_mut() else {
            out.extend_from_slice(input);
            return Ok(());
        };

        self.pending.extend_from_slice(input);
        let mut produced = Vec::new();
        while self.pending.len() >= inner.input_frames_next() {
            let needed = inner.input_frames_next();
            process_chunk(inner, &self.pending[..needed], &mut produced)?;
            self.pending.drain(..needed);
        }

        let skipped = self.skip.min(produced.len());
        self.skip -= skipped;
        out.extend_from_slice(&produced[skipped..]);
        Ok(())
    }
}

/// Converts whole buffers from one rate to another
pub struct BlockResampler {
    source_rate: u32,
    target_rate: u32,
    inner: Option<SincFixedIn<f32>>,
}

impl std::fmt::Debug for BlockResampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockResampler")
            .field("source_rate", &self.source_rate)
            .field("target_rate", &self.target_rate)
            .finish()
    }
}

impl BlockResampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Result<Self, ResampleError> {
        Ok(Self {
            source_rate,
            target_rate,
            inner: sinc_resampler(source_rate, target_rate, BLOCK_CHUNK_FRAMES)?,
        })
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    /// Convert `input` to exactly `frames` output samples.
    ///
    /// `lead_in` is the source audio that plays immediately before `input`
    /// (empty when there is none). It primes the filter so the join between
    /// two buffers stays smooth. Edges without neighbours are extended with
    /// the nearest sample rather than faded to zero.
    pub fn convert(
        &mut self,
        lead_in: &[f32],
        input: &[f32],
        frames: usize,
    ) -> Result<Vec<f32>, ResampleError> {
        let (Some(&first), Some(&last)) = (input.first(), input.last()) else {
            return Ok(vec![0.0; frames]);
        };

        let Some(inner) = self.inner.as_mut() else {
            return Ok(fit_length(input.to_vec(), frames));
        };
        inner.reset();

        let ratio = self.target_rate as f64 / self.source_rate as f64;
        let delay = inner.output_delay();
        let tail = LEAD_IN_FRAMES + ((delay + 2) as f64 / ratio).ceil() as usize;

        let lead = &lead_in[lead_in.len().saturating_sub(LEAD_IN_FRAMES)..];
        let pad = lead.first().copied().unwrap_or(first);
        let mut padded = Vec::with_capacity(LEAD_IN_FRAMES + input.len() + tail);
        padded.extend(iter::repeat(pad).take(LEAD_IN_FRAMES - lead.len()));
        padded.extend_from_slice(lead);
        padded.extend_from_slice(input);
        padded.extend(iter::repeat(last).take(tail));

        // Output index of the first sample of `input`
        let offset = delay + (LEAD_IN_FRAMES as f64 * ratio).round() as usize;

        let mut out = Vec::with_capacity(offset + frames + BLOCK_CHUNK_FRAMES);
        let mut pos = 0;
        while out.len() < offset + frames && pos < padded.len() {
            let end = (pos + inner.input_frames_next()).min(padded.len());
            process_chunk(inner, &padded[pos..end], &mut out)?;
            pos = end;
        }

        let converted: Vec<f32> = out.into_iter().skip(offset).take(frames).collect();
        Ok(fit_length(converted, frames))
    }
}

/// Pad with the final sample, or truncate, to exactly `frames`
fn fit_length(mut samples: Vec<f32>, frames: usize) -> Vec<f32> {
    let fill = samples.last().copied().unwrap_or(0.0);
    samples.resize(frames, fill);
    samples
}
