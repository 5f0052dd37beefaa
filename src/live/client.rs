//! Gemini Live API WebSocket client
//!
//! # Connection Flow
//!
//! 1. Connect (bounded by the connect timeout)
//! 2. Send `setup`, wait for `setupComplete` (bounded by the setup timeout)
//! 3. Split the socket: a writer task forwards queued frames as
//!    `realtimeInput`, a reader task turns server messages into
//!    [`TransportEvent`]s
//! 4. Closing the [`TransportHandle`] cancels both tasks; the writer sends a
//!    close frame on the way out
//!
//! No retries: a failed attempt is reported to the controller as is.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use super::protocol::{ClientMessage, ServerMessage, LIVE_API_URL};
use super::{LiveConfig, LiveError, Transport, TransportEvent, TransportHandle};
use crate::audio::EncodedPacket;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default timeout for the WebSocket handshake
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for `setupComplete`
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the incoming event queue
const EVENT_QUEUE_CAPACITY: usize = 256;

/// Transport backed by the Gemini Live WebSocket API
#[derive(Clone)]
pub struct GeminiLiveTransport {
    api_key: String,
    url: String,
    connect_timeout: Duration,
    setup_timeout: Duration,
}

impl GeminiLiveTransport {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_url(api_key, LIVE_API_URL)
    }

    /// Point at a different endpoint (the key is still appended as `?key=`)
    pub fn with_url(api_key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            url: url.into(),
            connect_timeout: CONNECT_TIMEOUT,
            setup_timeout: SETUP_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, setup: Duration) -> Self {
        self.connect_timeout = connect;
        self.setup_timeout = setup;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}?key={}", self.url, self.api_key)
    }

    async fn connect(self, config: LiveConfig) -> Result<TransportHandle, LiveError> {
        if self.api_key.is_empty() {
            return Err(LiveError::MissingApiKey);
        }

        // Several crates may pull in rustls; pick the provider explicitly.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let request = self
            .endpoint()
            .into_client_request()
            .map_err(|e| LiveError::ConnectionFailed(e.to_string()))?;

        log::info!("Connecting to Gemini Live API ({})...", self.url);

        let (ws_stream, _response) = timeout(
            self.connect_timeout,
            connect_async_with_config(request, None, true),
        )
        .await
        .map_err(|_| LiveError::Timeout("WebSocket connect".to_string()))?
        .map_err(|e| LiveError::ConnectionFailed(e.to_string()))?;

        log::info!("WebSocket connected, sending setup for {}", config.model);

        let (mut write, mut read) = ws_stream.split();

        let setup = ClientMessage::setup(&config.model, &config.voice, &config.system_instruction);
        send_message(&mut write, &setup).await?;

        timeout(self.setup_timeout, wait_for_setup_complete(&mut read))
            .await
            .map_err(|_| LiveError::Timeout("session setup".to_string()))??;

        log::info!("Live session ready");

        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.outgoing_capacity.max(1));
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let shutdown = CancellationToken::new();

        tokio::spawn(run_writer(
            write,
            outgoing_rx,
            event_tx.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(run_reader(read, event_tx, shutdown.clone()));

        Ok(TransportHandle::new(outgoing_tx, event_rx, shutdown))
    }
}

impl std::fmt::Debug for GeminiLiveTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the key
        f.debug_struct("GeminiLiveTransport")
            .field("url", &self.url)
            .field("connect_timeout", &self.connect_timeout)
            .field("setup_timeout", &self.setup_timeout)
            .finish_non_exhaustive()
    }
}

impl Transport for GeminiLiveTransport {
    fn open(&self, config: LiveConfig) -> BoxFuture<'static, Result<TransportHandle, LiveError>> {
        Box::pin(self.clone().connect(config))
    }
}

async fn send_message(
    write: &mut SplitSink<Socket, Message>,
    msg: &ClientMessage,
) -> Result<(), LiveError> {
    let json = serde_json::to_string(msg).map_err(|e| LiveError::ProtocolError(e.to_string()))?;

    write
        .send(Message::Text(json))
        .await
        .map_err(|e| LiveError::SendFailed(e.to_string()))
}

/// Decode a data frame; control frames yield `None`
fn parse_frame(msg: &Message) -> Option<Result<ServerMessage, serde_json::Error>> {
    match msg {
        Message::Text(text) => Some(ServerMessage::parse(text.as_bytes())),
        Message::Binary(bytes) => Some(ServerMessage::parse(bytes)),
        _ => None,
    }
}

async fn wait_for_setup_complete(read: &mut SplitStream<Socket>) -> Result<(), LiveError> {
    while let Some(msg_result) = read.next().await {
        let msg = msg_result.map_err(|e| LiveError::ProtocolError(e.to_string()))?;

        if let Message::Close(frame) = &msg {
            let reason = frame
                .as_ref()
                .map(|f| format!("{} ({})", f.reason, f.code))
                .unwrap_or_else(|| "connection closed before setup completed".to_string());
            return Err(LiveError::SetupRejected(reason));
        }

        match parse_frame(&msg) {
            Some(Ok(server_msg)) if server_msg.is_setup_complete() => return Ok(()),
            Some(Ok(_)) => log::debug!("Ignoring message while waiting for setupComplete"),
            Some(Err(e)) => log::warn!("Failed to parse message: {}", e),
            None => {}
        }
    }

    Err(LiveError::Disconnected("stream ended during setup".to_string()))
}

async fn run_writer(
    mut write: SplitSink<Socket, Message>,
    mut outgoing: mpsc::Receiver<EncodedPacket>,
    events: mpsc::Sender<TransportEvent>,
    shutdown: CancellationToken,
) {
    let mut sent: u64 = 0;

    loop {
        let packet = tokio::select! {
            _ = shutdown.cancelled() => break,
            packet = outgoing.recv() => packet,
        };
        let Some(packet) = packet else {
            break;
        };

        if let Err(e) = send_message(&mut write, &ClientMessage::audio(packet)).await {
            log::warn!("{}", e);
            let _ = events.try_send(TransportEvent::Error(e.to_string()));
            break;
        }

        sent += 1;
        if sent % 50 == 0 {
            log::debug!("Sent {} audio frames", sent);
        }
    }

    if let Err(e) = write.close().await {
        log::debug!("Error closing WebSocket: {}", e);
    }
    log::debug!("Writer task exiting after {} frames", sent);
}

async fn run_reader(
    mut read: SplitStream<Socket>,
    events: mpsc::Sender<TransportEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = read.next() => next,
        };

        let terminal = match next {
            None => Some(TransportEvent::Closed(None)),
            Some(Err(e)) => {
                log::warn!("WebSocket error: {}", e);
                Some(TransportEvent::Error(e.to_string()))
            }
            Some(Ok(Message::Close(frame))) => {
                log::info!("WebSocket closed by server: {:?}", frame);
                Some(TransportEvent::Closed(
                    frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty()),
                ))
            }
            Some(Ok(msg)) => {
                match parse_frame(&msg) {
                    Some(Ok(server_msg)) => {
                        for event in server_msg.into_events() {
                            if events.send(event).await.is_err() {
                                log::debug!("Event receiver dropped");
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => log::warn!("Failed to parse message: {}", e),
                    None => {}
                }
                None
            }
        };

        if let Some(event) = terminal {
            let _ = events.send(event).await;
            break;
        }
    }

    log::debug!("Reader task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_appends_key() {
        let transport = GeminiLiveTransport::with_url("secret", "wss://example.test/ws");
        assert_eq!(transport.endpoint(), "wss://example.test/ws?key=secret");
    }

    #[test]
    fn test_debug_hides_key() {
        let transport = GeminiLiveTransport::new("super-secret-key");
        let debug = format!("{:?}", transport);
        assert!(!debug.contains("super-secret-key"));
        assert!(debug.contains("generativelanguage"));
    }

    #[test]
    fn test_parse_frame_text_and_binary() {
        let text = Message::Text(r#"{"setupComplete": {}}"#.to_string());
        assert!(parse_frame(&text).unwrap().unwrap().is_setup_complete());

        let binary = Message::Binary(br#"{"setupComplete": {}}"#.to_vec());
        assert!(parse_frame(&binary).unwrap().unwrap().is_setup_complete());

        assert!(parse_frame(&Message::Ping(vec![])).is_none());
    }

    #[tokio::test]
    async fn test_missing_key_fails_fast() {
        let transport = GeminiLiveTransport::new("");
        let result = transport.open(LiveConfig::default()).await;
        assert!(matches!(result, Err(LiveError::MissingApiKey)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails() {
        let transport = GeminiLiveTransport::with_url("key", "ws://127.0.0.1:1/ws")
            .with_timeouts(Duration::from_secs(2), Duration::from_secs(2));
        let result = transport.open(LiveConfig::default()).await;
        assert!(matches!(
            result,
            Err(LiveError::ConnectionFailed(_)) | Err(LiveError::Timeout(_))
        ));
    }

    #[tokio::test]
    #[ignore] // Requires GEMINI_API_KEY and network access
    async fn test_live_connection() {
        let api_key = std::env::var("GEMINI_API_KEY").expect("GEMINI_API_KEY required");

        let mut handle = GeminiLiveTransport::new(api_key)
            .open(LiveConfig::for_topic("Rust"))
            .await
            .expect("Connection failed");

        let silence = crate::audio::AudioFrame::from_float(&[0.0; 1600], 16_000);
        assert!(handle.try_send(silence.to_packet()));

        handle.close();
    }
}
