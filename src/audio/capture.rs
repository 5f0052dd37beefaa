//! Microphone capture pipeline
//!
//! Turns device callbacks into fixed-size encoded frames for the live API:
//!
//! ```text
//! Audio Thread (device callback)
//! ┌───────────────────────────────────────────────────────────────┐
//! │ interleaved f32 ─▶ downmix ─▶ resample (16kHz) ─▶ 4096 block  │
//! │                                    ─▶ PCM16 ─▶ base64 ─▶ sink │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Frames are fire-and-forget. The sink reports whether it accepted a frame;
//! refused frames are counted and dropped, never queued or retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::codec::{AudioFrame, EncodedPacket, CAPTURE_SAMPLE_RATE};
use super::resample::{downmix, StreamResampler};

/// Samples per emitted frame at the capture rate
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Callback receiving interleaved device samples
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Errors that can occur while acquiring or running the microphone
#[derive(Debug, Clone)]
pub enum CaptureError {
    NoInputDevice,
    PermissionDenied(String),
    UnsupportedConfig(String),
    StreamFailed(String),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::NoInputDevice => write!(f, "No audio input device found"),
            CaptureError::PermissionDenied(e) => write!(f, "Microphone access denied: {}", e),
            CaptureError::UnsupportedConfig(e) => {
                write!(f, "No supported microphone configuration: {}", e)
            }
            CaptureError::StreamFailed(e) => write!(f, "Failed to run microphone stream: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

/// Source of microphone streams
pub trait Microphone: Send + Sync + 'static {
    /// Open the input device. This is the permission/availability check.
    fn acquire(&self) -> Result<Box<dyn MicrophoneStream>, CaptureError>;
}

/// A live, acquired input stream
pub trait MicrophoneStream: Send {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Begin delivering interleaved samples to `callback` from the device thread
    fn start(&mut self, callback: SampleCallback) -> Result<(), CaptureError>;

    /// Disconnect the callback and release the device. Must be idempotent.
    fn release(&mut self);
}

/// Capture framing parameters
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Rate of emitted frames (the live API expects 16kHz)
    pub target_sample_rate: u32,
    /// Samples per emitted frame
    pub block_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: CAPTURE_SAMPLE_RATE,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl CaptureConfig {
    /// Duration of one frame in milliseconds
    pub fn block_duration_ms(&self) -> u64 {
        if self.target_sample_rate == 0 {
            return 0;
        }
        (self.block_size as u64 * 1000) / self.target_sample_rate as u64
    }
}

/// Accumulates device samples into encoded fixed-size frames
#[derive(Debug)]
pub struct FrameAssembler {
    channels: usize,
    resampler: StreamResampler,
    block_size: usize,
    target_sample_rate: u32,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(
        device_rate: u32,
        channels: u16,
        config: &CaptureConfig,
    ) -> Result<Self, CaptureError> {
        let block_size = config.block_size.max(1);
        let resampler = StreamResampler::new(device_rate, config.target_sample_rate)
            .map_err(|e| CaptureError::UnsupportedConfig(e.to_string()))?;
        Ok(Self {
            channels: channels.max(1) as usize,
            resampler,
            block_size,
            target_sample_rate: config.target_sample_rate,
            pending: Vec::with_capacity(block_size * 2),
        })
    }

    /// Feed one device callback's worth of interleaved samples.
    /// Returns every frame completed by this input, oldest first.
    pub fn push(&mut self, interleaved: &[f32]) -> Vec<EncodedPacket> {
        let mono = downmix(interleaved, self.channels);
        if let Err(e) = self.resampler.process_into(&mono, &mut self.pending) {
            log::warn!("CapturePipeline: dropping {} samples: {}", mono.len(), e);
        }

        let mut frames = Vec::new();
        while self.pending.len() >= self.block_size {
            let block: Vec<f32> = self.pending.drain(..self.block_size).collect();
            frames.push(AudioFrame::from_float(&block, self.target_sample_rate).to_packet());
        }
        frames
    }

    /// Samples waiting for a full block
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }
}

/// Frame counters shared with the device thread
#[derive(Debug, Default)]
pub struct CaptureStats {
    frames_emitted: AtomicU64,
    frames_dropped: AtomicU64,
}

impl CaptureStats {
    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }
}

/// Running capture: owns the microphone stream until stopped
pub struct CapturePipeline {
    stream: Option<Box<dyn MicrophoneStream>>,
    stats: Arc<CaptureStats>,
}

impl CapturePipeline {
    /// Start pulling audio from `stream`, handing every frame to `on_frame`.
    ///
    /// `on_frame` runs on the device thread and must not block. It returns
    /// `false` when the frame could not be accepted; the frame is then dropped.
    pub fn start<F>(
        mut stream: Box<dyn MicrophoneStream>,
        config: &CaptureConfig,
        mut on_frame: F,
    ) -> Result<Self, CaptureError>
    where
        F: FnMut(EncodedPacket) -> bool + Send + 'static,
    {
        let mut assembler =
            match FrameAssembler::new(stream.sample_rate(), stream.channels(), config) {
                Ok(assembler) => assembler,
                Err(e) => {
                    stream.release();
                    return Err(e);
                }
            };
        let stats = Arc::new(CaptureStats::default());
        let callback_stats = stats.clone();

        log::info!(
            "CapturePipeline: {}Hz x{} → {}Hz, {} samples ({}ms) per frame",
            stream.sample_rate(),
            stream.channels(),
            config.target_sample_rate,
            config.block_size,
            config.block_duration_ms()
        );

        let callback: SampleCallback = Box::new(move |data: &[f32]| {
            for packet in assembler.push(data) {
                if on_frame(packet) {
                    let emitted = callback_stats.frames_emitted.fetch_add(1, Ordering::Relaxed) + 1;
                    if emitted % 50 == 0 {
                        log::debug!("CapturePipeline: emitted {} frames", emitted);
                    }
                } else {
                    let dropped = callback_stats.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped == 1 || dropped % 50 == 0 {
                        log::warn!("CapturePipeline: transport not ready, {} frames dropped", dropped);
                    }
                }
            }
        });

        if let Err(e) = stream.start(callback) {
            stream.release();
            return Err(e);
        }

        Ok(Self {
            stream: Some(stream),
            stats,
        })
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    /// Disconnect processing and release the microphone
    pub fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.release();
            log::info!(
                "CapturePipeline: stopped ({} frames sent, {} dropped)",
                self.stats.frames_emitted(),
                self.stats.frames_dropped()
            );
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Fake stream that lets tests push samples through the installed callback
    struct ScriptedStream {
        rate: u32,
        channels: u16,
        callback: Arc<Mutex<Option<SampleCallback>>>,
        releases: Arc<AtomicU64>,
        fail_start: bool,
    }

    impl MicrophoneStream for ScriptedStream {
        fn sample_rate(&self) -> u32 {
            self.rate
        }

        fn channels(&self) -> u16 {
            self.channels
        }

        fn start(&mut self, callback: SampleCallback) -> Result<(), CaptureError> {
            if self.fail_start {
                return Err(CaptureError::StreamFailed("boom".to_string()));
            }
            *self.callback.lock().unwrap() = Some(callback);
            Ok(())
        }

        fn release(&mut self) {
            if self.callback.lock().unwrap().take().is_some() || self.fail_start {
                self.releases.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn scripted(rate: u32, channels: u16) -> (ScriptedStream, Arc<Mutex<Option<SampleCallback>>>, Arc<AtomicU64>) {
        let callback = Arc::new(Mutex::new(None));
        let releases = Arc::new(AtomicU64::new(0));
        let stream = ScriptedStream {
            rate,
            channels,
            callback: callback.clone(),
            releases: releases.clone(),
            fail_start: false,
        };
        (stream, callback, releases)
    }

    fn feed(callback: &Arc<Mutex<Option<SampleCallback>>>, data: &[f32]) {
        if let Some(cb) = callback.lock().unwrap().as_mut() {
            cb(data);
        }
    }

    #[test]
    fn test_block_duration() {
        let config = CaptureConfig::default();
        // 4096 samples at 16kHz = 256ms
        assert_eq!(config.block_duration_ms(), 256);
    }

    #[test]
    fn test_assembler_emits_full_blocks_only() {
        let config = CaptureConfig {
            target_sample_rate: 16_000,
            block_size: 4,
        };
        let mut assembler = FrameAssembler::new(16_000, 1, &config).unwrap();

        assert!(assembler.push(&[0.1, 0.2, 0.3]).is_empty());
        assert_eq!(assembler.pending_samples(), 3);

        let frames = assembler.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(frames.len(), 2);
        assert_eq!(assembler.pending_samples(), 1);
        assert_eq!(frames[0].mime_type, "audio/pcm;rate=16000");

        let first = frames[0].to_frame().unwrap();
        assert_eq!(first.samples().len(), 4);
        assert_eq!(first.samples()[0], (0.1f32 * 32768.0) as i16);
    }

    #[test]
    fn test_assembler_resamples_and_downmixes() {
        let config = CaptureConfig {
            target_sample_rate: 16_000,
            block_size: 1600,
        };
        // One second of 48kHz stereo in 10ms callbacks
        let mut assembler = FrameAssembler::new(48_000, 2, &config).unwrap();
        let mut frames = Vec::new();
        for _ in 0..100 {
            frames.extend(assembler.push(&[0.25; 960]));
        }

        assert!(frames.len() >= 8, "got {} frames", frames.len());
        let last = frames.last().unwrap().to_frame().unwrap();
        assert_eq!(last.sample_rate(), 16_000);
        assert!(last.samples().iter().all(|&s| (s - 8192).abs() < 200));
    }

    #[test]
    fn test_pipeline_forwards_frames_in_order() {
        let (stream, callback, _) = scripted(16_000, 1);
        let config = CaptureConfig {
            target_sample_rate: 16_000,
            block_size: 2,
        };
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();

        let pipeline = CapturePipeline::start(Box::new(stream), &config, move |packet| {
            sink.lock().unwrap().push(packet);
            true
        })
        .unwrap();

        feed(&callback, &[0.0, 0.5, -0.5, 0.25, 0.125]);

        let frames = received.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].to_frame().unwrap().samples(), &[0, 16384]);
        assert_eq!(frames[1].to_frame().unwrap().samples(), &[-16384, 8192]);
        assert_eq!(pipeline.stats().frames_emitted(), 2);
    }

    #[test]
    fn test_refused_frames_are_dropped_and_counted() {
        let (stream, callback, _) = scripted(16_000, 1);
        let config = CaptureConfig {
            target_sample_rate: 16_000,
            block_size: 1,
        };
        let pipeline =
            CapturePipeline::start(Box::new(stream), &config, |_packet| false).unwrap();

        feed(&callback, &[0.1, 0.2, 0.3]);

        assert_eq!(pipeline.stats().frames_emitted(), 0);
        assert_eq!(pipeline.stats().frames_dropped(), 3);
    }

    #[test]
    fn test_stop_releases_once() {
        let (stream, callback, releases) = scripted(16_000, 1);
        let mut pipeline =
            CapturePipeline::start(Box::new(stream), &CaptureConfig::default(), |_| true).unwrap();

        assert!(pipeline.is_running());
        pipeline.stop();
        pipeline.stop();
        drop(pipeline);

        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(callback.lock().unwrap().is_none());
    }

    #[test]
    fn test_failed_start_releases_stream() {
        let (mut stream, _, releases) = scripted(16_000, 1);
        stream.fail_start = true;

        let result = CapturePipeline::start(Box::new(stream), &CaptureConfig::default(), |_| true);

        assert!(matches!(result, Err(CaptureError::StreamFailed(_))));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }
}
