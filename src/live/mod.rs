//! Live voice session transport
//!
//! Full-duplex channel to the Gemini Live API: captured 16kHz frames go up,
//! 24kHz voice audio and barge-in signals come back.
//!
//! # Architecture
//!
//! ```text
//! CapturePipeline ──try_send──▶ outgoing (bounded) ──▶ writer task ──▶ WebSocket
//!                                                                         │
//! Controller ◀── events (TransportEvent) ◀── reader task ◀────────────────┘
//! ```
//!
//! # Failure Strategy
//!
//! - Connect and setup are each bounded by a timeout
//! - Nothing is retried; a failed open or a mid-session error ends the session

mod client;
mod protocol;

pub use client::GeminiLiveTransport;
pub use protocol::{ClientMessage, ServerMessage, DEFAULT_MODEL, DEFAULT_VOICE, LIVE_API_URL};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::EncodedPacket;

/// Errors that can occur while opening or running a live session
#[derive(Debug, Clone)]
pub enum LiveError {
    /// API key not configured
    MissingApiKey,
    /// Failed to establish the WebSocket connection
    ConnectionFailed(String),
    /// A connection phase did not finish in time
    Timeout(String),
    /// The server refused the setup message
    SetupRejected(String),
    /// Malformed or unexpected message
    ProtocolError(String),
    /// Connection closed unexpectedly
    Disconnected(String),
    /// Failed to send audio
    SendFailed(String),
}

impl std::fmt::Display for LiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LiveError::MissingApiKey => {
                write!(
                    f,
                    "Gemini API key not configured. Set GEMINI_API_KEY or store it in the keyring."
                )
            }
            LiveError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to Gemini Live API: {}", e)
            }
            LiveError::Timeout(phase) => write!(f, "Timed out during {}", phase),
            LiveError::SetupRejected(e) => write!(f, "Session setup rejected: {}", e),
            LiveError::ProtocolError(e) => write!(f, "WebSocket protocol error: {}", e),
            LiveError::Disconnected(e) => write!(f, "WebSocket disconnected: {}", e),
            LiveError::SendFailed(e) => write!(f, "Failed to send audio: {}", e),
        }
    }
}

impl std::error::Error for LiveError {}

/// Notification delivered by an open transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// One chunk of voice audio
    Audio(EncodedPacket),
    /// The user barged in; queued playback must be flushed
    Interrupted,
    /// The model finished its turn
    TurnComplete,
    /// The connection ended normally (close reason, if any)
    Closed(Option<String>),
    /// The connection failed
    Error(String),
}

/// Parameters for opening a live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveConfig {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    /// Capacity of the outgoing frame queue
    pub outgoing_capacity: usize,
}

impl LiveConfig {
    pub fn for_topic(topic: &str) -> Self {
        Self {
            system_instruction: interviewer_instruction(topic),
            ..Self::default()
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: String::new(),
            outgoing_capacity: 32,
        }
    }
}

/// System instruction for an interview on `topic`
pub fn interviewer_instruction(topic: &str) -> String {
    format!(
        "You are a technical interviewer testing a student on \"{}\". \
         Speak naturally and ask follow-up questions based on their answers.",
        topic
    )
}

/// Opens live sessions
///
/// Implemented by [`GeminiLiveTransport`] for the real service and by fakes
/// in tests.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, config: LiveConfig) -> BoxFuture<'static, Result<TransportHandle, LiveError>>;
}

/// Handle to one open transport session
///
/// Dropping the handle closes the session.
pub struct TransportHandle {
    outgoing: mpsc::Sender<EncodedPacket>,
    events: mpsc::Receiver<TransportEvent>,
    shutdown: CancellationToken,
}

impl TransportHandle {
    /// Assemble a handle from its channels; `shutdown` is cancelled on close
    pub fn new(
        outgoing: mpsc::Sender<EncodedPacket>,
        events: mpsc::Receiver<TransportEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            outgoing,
            events,
            shutdown,
        }
    }

    /// Sender for the capture frame sink
    pub fn sender(&self) -> mpsc::Sender<EncodedPacket> {
        self.outgoing.clone()
    }

    /// Queue one frame without waiting. Returns false if it was dropped.
    pub fn try_send(&self, packet: EncodedPacket) -> bool {
        self.outgoing.try_send(packet).is_ok()
    }

    /// Next event, or `None` once the transport is gone
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Close the session. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.events.close();
        log::info!("Live transport closed");
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.close();
    }
}
