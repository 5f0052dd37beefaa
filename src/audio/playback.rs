//! Gapless playback scheduling for received voice audio
//!
//! Packets from the live API arrive with network jitter. Each one is decoded
//! and queued on the output device's clock right after the previous one:
//!
//! ```text
//! start = max(next_start_time, device.current_time())
//! next_start_time = start + buffer.duration()
//! ```
//!
//! Packets that arrive early play back-to-back with no gap; late packets play
//! immediately (an audible gap, not an error). Every scheduled source is kept
//! in an arena keyed by a monotonic [`SourceId`] so an interruption can stop
//! all of them at once.

use std::collections::BTreeMap;

use tokio::sync::mpsc;

use super::codec::{DecodeError, EncodedPacket, PlaybackBuffer};

/// Handle of one scheduled buffer on the output device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub u64);

/// Channel on which devices report naturally finished sources
pub type FinishedSender = mpsc::UnboundedSender<SourceId>;

/// Errors that can occur during playback
#[derive(Debug, Clone)]
pub enum PlaybackError {
    NoOutputDevice,
    UnsupportedConfig(String),
    StreamFailed(String),
    /// The packet could not be decoded; the session continues
    Decode(DecodeError),
    /// The output context was already released
    Closed,
}

impl std::fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackError::NoOutputDevice => write!(f, "No audio output device found"),
            PlaybackError::UnsupportedConfig(e) => {
                write!(f, "No supported output configuration: {}", e)
            }
            PlaybackError::StreamFailed(e) => write!(f, "Failed to run output stream: {}", e),
            PlaybackError::Decode(e) => write!(f, "Dropped undecodable audio packet: {}", e),
            PlaybackError::Closed => write!(f, "Output context already closed"),
        }
    }
}

impl std::error::Error for PlaybackError {}

impl From<DecodeError> for PlaybackError {
    fn from(e: DecodeError) -> Self {
        PlaybackError::Decode(e)
    }
}

/// Factory for output contexts
pub trait Speaker: Send + Sync + 'static {
    /// Open an output context. Finished sources are reported on `finished`.
    fn open(
        &self,
        sample_rate: u32,
        finished: FinishedSender,
    ) -> Result<Box<dyn PlaybackDevice>, PlaybackError>;
}

/// An open audio output context with its own clock
pub trait PlaybackDevice: Send {
    /// Monotonic device clock in seconds
    fn current_time(&self) -> f64;

    /// Queue `buffer` to start at `start_at` on the device clock
    fn schedule(
        &mut self,
        id: SourceId,
        buffer: PlaybackBuffer,
        start_at: f64,
    ) -> Result<(), PlaybackError>;

    /// Stop a scheduled or playing source. Unknown ids are ignored.
    fn stop(&mut self, id: SourceId);

    /// Release the output context
    fn close(&mut self);
}

/// Bookkeeping for one entry in the scheduled source set
#[derive(Debug, Clone, Copy, PartialEq)]
struct ScheduledSource {
    start: f64,
    duration: f64,
}

impl ScheduledSource {
    fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Orders decoded packets onto the output device clock
pub struct PlaybackScheduler {
    device: Option<Box<dyn PlaybackDevice>>,
    channels: usize,
    next_start_time: f64,
    next_source_id: u64,
    sources: BTreeMap<SourceId, ScheduledSource>,
    packets_scheduled: u64,
    interruptions: u64,
}

impl PlaybackScheduler {
    /// Wrap an open device. `channels` is the channel count of incoming PCM.
    pub fn new(device: Box<dyn PlaybackDevice>, channels: usize) -> Self {
        let next_start_time = device.current_time();
        Self {
            device: Some(device),
            channels: channels.max(1),
            next_start_time,
            next_source_id: 0,
            sources: BTreeMap::new(),
            packets_scheduled: 0,
            interruptions: 0,
        }
    }

    /// Decode and schedule one packet. Returns its start time.
    pub fn on_packet_received(&mut self, packet: &EncodedPacket) -> Result<f64, PlaybackError> {
        let buffer = packet.decode_playback(self.channels)?;
        self.schedule_buffer(buffer)
    }

    /// Schedule an already-decoded buffer. Returns its start time.
    pub fn schedule_buffer(&mut self, buffer: PlaybackBuffer) -> Result<f64, PlaybackError> {
        let device = self.device.as_mut().ok_or(PlaybackError::Closed)?;

        let duration = buffer.duration();
        let start = self.next_start_time.max(device.current_time());
        let id = SourceId(self.next_source_id);

        device.schedule(id, buffer, start)?;

        self.next_source_id += 1;
        self.next_start_time = start + duration;
        self.sources.insert(id, ScheduledSource { start, duration });
        self.packets_scheduled += 1;

        if self.packets_scheduled % 50 == 0 {
            log::debug!(
                "PlaybackScheduler: {} packets scheduled, {} in flight, queued until {:.3}s",
                self.packets_scheduled,
                self.sources.len(),
                self.next_start_time
            );
        }

        Ok(start)
    }

    /// Device reported that a source played to completion
    pub fn on_source_finished(&mut self, id: SourceId) {
        match self.sources.remove(&id) {
            Some(source) => log::trace!("PlaybackScheduler: {:?} done at {:.3}s", id, source.end()),
            None => log::trace!("PlaybackScheduler: finished notice for untracked {:?}", id),
        }
    }

    /// Barge-in: stop everything queued and restart the clock
    pub fn on_interrupt(&mut self) {
        if !self.sources.is_empty() {
            log::info!(
                "PlaybackScheduler: interrupted, flushing {} sources",
                self.sources.len()
            );
            self.interruptions += 1;
        }

        if let Some(device) = self.device.as_mut() {
            for id in self.sources.keys() {
                device.stop(*id);
            }
        }
        self.sources.clear();
        self.next_start_time = 0.0;
    }

    /// Flush and release the output context. Idempotent.
    pub fn reset(&mut self) {
        self.on_interrupt();
        if let Some(mut device) = self.device.take() {
            device.close();
            log::info!(
                "PlaybackScheduler: output released ({} packets, {} interruptions)",
                self.packets_scheduled,
                self.interruptions
            );
        }
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Number of sources scheduled or playing
    pub fn active_sources(&self) -> usize {
        self.sources.len()
    }

    pub fn is_closed(&self) -> bool {
        self.device.is_none()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.reset();
    }
}
