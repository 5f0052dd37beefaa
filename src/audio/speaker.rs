//! CPAL-backed output context
//!
//! Provides the device side of [`PlaybackScheduler`](super::playback::PlaybackScheduler):
//! a monotonic clock derived from frames rendered, sources queued at absolute
//! clock positions, and a finished notification per source.
//!
//! # Architecture
//!
//! ```text
//! Session task                      Audio Thread (cpal callback)
//! ┌──────────────────┐              ┌─────────────────────────────┐
//! │ schedule(id, t)  │──Mutex──▶    │ Mixer::render()             │
//! │ stop(id)         │              │   ├─ sum voices due now     │
//! │ current_time()   │◀─Atomic──    │   ├─ advance frame clock    │
//! └──────────────────┘              │   └─ finished ─▶ channel    │
//!                                   └─────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, Stream, StreamConfig};

use super::codec::PlaybackBuffer;
use super::join_audio_thread;
use super::playback::{FinishedSender, PlaybackDevice, PlaybackError, SourceId, Speaker};
use super::resample::{BlockResampler, LEAD_IN_FRAMES};

/// One queued buffer, already converted to the device rate
#[derive(Debug)]
struct Voice {
    id: SourceId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Turns scheduled buffers into device-rate voices.
///
/// A voice covers exactly the frames between its rounded start and end
/// times, so a buffer scheduled at the previous one's end begins on the very
/// frame the previous one stops.
#[derive(Debug)]
pub(crate) struct VoiceShaper {
    device_rate: u32,
    converter: Option<BlockResampler>,
    /// Source samples at the end of the previous voice
    tail: Vec<f32>,
    tail_rate: u32,
    tail_end_frame: Option<u64>,
}

impl VoiceShaper {
    pub(crate) fn new(device_rate: u32) -> Self {
        Self {
            device_rate,
            converter: None,
            tail: Vec::new(),
            tail_rate: 0,
            tail_end_frame: None,
        }
    }

    /// Frame span and device-rate samples for `buffer` starting at `start_at` seconds
    pub(crate) fn shape(
        &mut self,
        buffer: PlaybackBuffer,
        start_at: f64,
    ) -> Result<(u64, Vec<f32>), PlaybackError> {
        let rate = self.device_rate as f64;
        let start_at = start_at.max(0.0);
        let duration = buffer.duration();
        let source_rate = buffer.sample_rate();
        let mono = buffer.into_mono();

        let start_frame = (start_at * rate).round() as u64;
        let end_frame = ((start_at + duration) * rate).round() as u64;
        let frames = end_frame.saturating_sub(start_frame) as usize;

        let contiguous = self.tail_end_frame == Some(start_frame) && self.tail_rate == source_rate;
        let lead_in: &[f32] = if contiguous { &self.tail } else { &[] };

        if self.converter.as_ref().map(BlockResampler::source_rate) != Some(source_rate) {
            self.converter = None;
        }
        let mut converter = match self.converter.take() {
            Some(converter) => converter,
            None => BlockResampler::new(source_rate, self.device_rate)
                .map_err(|e| PlaybackError::UnsupportedConfig(e.to_string()))?,
        };
        let samples = converter
            .convert(lead_in, &mono, frames)
            .map_err(|e| PlaybackError::StreamFailed(e.to_string()));
        self.converter = Some(converter);
        let samples = samples?;

        self.tail = mono[mono.len().saturating_sub(LEAD_IN_FRAMES)..].to_vec();
        self.tail_rate = source_rate;
        self.tail_end_frame = Some(end_frame);

        Ok((start_frame, samples))
    }

    /// Break continuity, e.g. after an interruption
    pub(crate) fn forget(&mut self) {
        self.tail.clear();
        self.tail_end_frame = None;
    }
}

/// Software mixer shared between the session and the audio callback
#[derive(Debug)]
pub(crate) struct Mixer {
    voices: Vec<Voice>,
    frames_rendered: Arc<AtomicU64>,
    finished: FinishedSender,
}

impl Mixer {
    pub(crate) fn new(finished: FinishedSender) -> Self {
        Self {
            voices: Vec::new(),
            frames_rendered: Arc::new(AtomicU64::new(0)),
            finished,
        }
    }

    fn clock(&self) -> Arc<AtomicU64> {
        self.frames_rendered.clone()
    }

    pub(crate) fn add(&mut self, id: SourceId, start_frame: u64, samples: Vec<f32>) {
        self.voices.push(Voice {
            id,
            start_frame,
            samples,
        });
    }

    pub(crate) fn remove(&mut self, id: SourceId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        before != self.voices.len()
    }

    /// Mix the next `out.len()` mono frames and advance the clock
    pub(crate) fn render(&mut self, out: &mut [f32]) {
        out.iter_mut().for_each(|s| *s = 0.0);

        let block_start = self.frames_rendered.load(Ordering::Acquire);
        let block_end = block_start + out.len() as u64;

        for voice in &self.voices {
            let from = voice.start_frame.max(block_start);
            let to = voice.end_frame().min(block_end);
            if from >= to {
                continue;
            }
            let src = &voice.samples[(from - voice.start_frame) as usize..(to - voice.start_frame) as usize];
            let dst = &mut out[(from - block_start) as usize..(to - block_start) as usize];
            for (d, s) in dst.iter_mut().zip(src) {
                *d += *s;
            }
        }

        self.frames_rendered.store(block_end, Ordering::Release);

        let finished = &self.finished;
        self.voices.retain(|voice| {
            if voice.end_frame() <= block_end {
                let _ = finished.send(voice.id);
                false
            } else {
                true
            }
        });
    }
}

/// Default system output device
#[derive(Debug, Default, Clone)]
pub struct CpalSpeaker;

impl CpalSpeaker {
    pub fn new() -> Self {
        Self
    }
}

impl Speaker for CpalSpeaker {
    fn open(
        &self,
        sample_rate: u32,
        finished: FinishedSender,
    ) -> Result<Box<dyn PlaybackDevice>, PlaybackError> {
        let (ready_tx, ready_rx) =
            std_mpsc::sync_channel::<Result<(Arc<Mutex<Mixer>>, u32), PlaybackError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("voice-playback".to_string())
            .spawn(move || match open_output_stream(sample_rate, finished) {
                Ok((stream, mixer, device_rate)) => {
                    let _ = ready_tx.send(Ok((mixer, device_rate)));
                    let _ = stop_rx.recv();
                    drop(stream);
                    log::debug!("Playback thread exiting, output released");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| PlaybackError::StreamFailed(format!("spawn audio thread: {}", e)))?;

        let (mixer, device_rate) = match ready_rx.recv() {
            Ok(result) => result?,
            Err(_) => {
                return Err(PlaybackError::StreamFailed(
                    "audio thread exited before reporting".to_string(),
                ))
            }
        };

        let clock = mixer
            .lock()
            .map(|m| m.clock())
            .map_err(|_| PlaybackError::StreamFailed("mixer poisoned".to_string()))?;

        Ok(Box::new(CpalOutput {
            mixer,
            clock,
            device_rate,
            shaper: VoiceShaper::new(device_rate),
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }))
    }
}

/// Handle to an output stream running on its audio thread
pub struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    clock: Arc<AtomicU64>,
    device_rate: u32,
    shaper: VoiceShaper,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackDevice for CpalOutput {
    fn current_time(&self) -> f64 {
        self.clock.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }

    fn schedule(
        &mut self,
        id: SourceId,
        buffer: PlaybackBuffer,
        start_at: f64,
    ) -> Result<(), PlaybackError> {
        if self.stop_tx.is_none() {
            return Err(PlaybackError::Closed);
        }
        // Convert before taking the lock the audio callback needs
        let (start_frame, samples) = self.shaper.shape(buffer, start_at)?;
        let mut mixer = self
            .mixer
            .lock()
            .map_err(|_| PlaybackError::StreamFailed("mixer poisoned".to_string()))?;
        mixer.add(id, start_frame, samples);
        Ok(())
    }

    fn stop(&mut self, id: SourceId) {
        self.shaper.forget();
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.remove(id);
        }
    }

    fn close(&mut self) {
        let Some(stop_tx) = self.stop_tx.take() else {
            return;
        };
        let _ = stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            join_audio_thread(thread, "Playback");
        }
        log::info!("Output context closed");
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_output_stream(
    requested_rate: u32,
    finished: FinishedSender,
) -> Result<(Stream, Arc<Mutex<Mixer>>, u32), PlaybackError> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or(PlaybackError::NoOutputDevice)?;

    log::info!("Using audio output device: {:?}", device.name());

    // Prefer the voice's native rate; fall back to the device default and
    // let the mixer resample.
    let supported_config = device
        .supported_output_configs()
        .ok()
        .and_then(|mut configs| {
            configs.find(|c| {
                matches!(
                    c.sample_format(),
                    SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16
                ) && c.min_sample_rate().0 <= requested_rate
                    && requested_rate <= c.max_sample_rate().0
            })
        })
        .map(|c| c.with_sample_rate(cpal::SampleRate(requested_rate)))
        .map_or_else(|| device.default_output_config(), Ok)
        .map_err(|e| PlaybackError::UnsupportedConfig(e.to_string()))?;

    log::info!(
        "Output config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();
    let mixer = Arc::new(Mutex::new(Mixer::new(finished)));

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, mixer.clone())?,
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, mixer.clone())?,
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, mixer.clone())?,
        other => {
            return Err(PlaybackError::UnsupportedConfig(format!(
                "sample format {:?}",
                other
            )))
        }
    };

    stream
        .play()
        .map_err(|e| PlaybackError::StreamFailed(format!("Failed to start stream: {}", e)))?;

    Ok((stream, mixer, config.sample_rate.0))
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
) -> Result<Stream, PlaybackError>
where
    T: cpal::SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let err_fn = |err: cpal::StreamError| log::error!("Audio output stream error: {}", err);
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                mono.resize(frames, 0.0);

                match mixer.try_lock() {
                    Ok(mut guard) => guard.render(&mut mono),
                    // Scheduler holds the lock for a moment; emit silence
                    // without advancing the clock.
                    Err(_) => mono.iter_mut().for_each(|s| *s = 0.0),
                }

                for (frame, &value) in data.chunks_mut(channels).zip(&mono) {
                    let sample = T::from_sample(value.clamp(-1.0, 1.0));
                    frame.iter_mut().for_each(|s| *s = sample);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| PlaybackError::StreamFailed(e.to_string()))
}
