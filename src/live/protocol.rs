//! Gemini Live API protocol types
//!
//! JSON messages exchanged over the `BidiGenerateContent` WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://generativelanguage.googleapis.com/ws/...BidiGenerateContent?key=<KEY>`
//! 2. Send `{"setup": {...}}` with model, voice and system instruction
//! 3. Receive `{"setupComplete": {}}`
//! 4. Stream microphone audio via `{"realtimeInput": {"mediaChunks": [...]}}`
//! 5. Receive voice audio in `serverContent.modelTurn.parts[].inlineData`
//! 6. `serverContent.interrupted` signals barge-in: flush queued playback
//!
//! Server frames may arrive as text or binary; both carry JSON.

use serde::{Deserialize, Serialize};

use crate::audio::EncodedPacket;

use super::TransportEvent;

/// Gemini Live WebSocket endpoint (the API key is appended as `?key=`)
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Native-audio model used for the interview voice
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Prebuilt voice of the interviewer
pub const DEFAULT_VOICE: &str = "Puck";

/// Output modality requested from the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Modality {
    Audio,
    Text,
}

/// Base64 payload with MIME type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

impl From<EncodedPacket> for Blob {
    fn from(packet: EncodedPacket) -> Self {
        Self {
            mime_type: packet.mime_type,
            data: packet.data,
        }
    }
}

impl From<Blob> for EncodedPacket {
    fn from(blob: Blob) -> Self {
        EncodedPacket::new(blob.data, blob.mime_type)
    }
}

/// One part of a content turn
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

/// A content turn (system instruction or model output)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![Part {
                text: Some(text.into()),
                inline_data: None,
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

/// First message on a new connection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    /// Fully-qualified model name (`models/<id>`)
    pub model: String,

    pub generation_config: GenerationConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

/// Streaming input from the user
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

// ============================================================================
// Client Messages (sent TO Gemini)
// ============================================================================

/// Messages sent from client to the Live API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Build the setup message for an audio-only session
    pub fn setup(model: &str, voice: &str, system_instruction: &str) -> Self {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        };

        Self::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![Modality::Audio],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice.to_string(),
                        },
                    },
                }),
            },
            system_instruction: if system_instruction.is_empty() {
                None
            } else {
                Some(Content::text(system_instruction))
            },
        })
    }

    /// Wrap one captured frame
    pub fn audio(packet: EncodedPacket) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![packet.into()],
        })
    }
}

// ============================================================================
// Server Messages (received FROM Gemini)
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,

    #[serde(default)]
    pub interrupted: bool,

    #[serde(default)]
    pub turn_complete: bool,

    #[serde(default)]
    pub generation_complete: bool,
}

/// Server notice that the connection will end soon
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Messages received from the Live API.
///
/// Each message carries exactly one populated field; fields this client does
/// not handle (tool calls, usage metadata, ...) are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,

    #[serde(default)]
    pub server_content: Option<ServerContent>,

    #[serde(default)]
    pub go_away: Option<GoAway>,
}

impl ServerMessage {
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Translate into transport events, in wire order: audio first, then
    /// the interruption flag, then turn completion.
    pub fn into_events(self) -> Vec<TransportEvent> {
        let mut events = Vec::new();

        if let Some(go_away) = &self.go_away {
            log::warn!(
                "Live API will close the connection soon (time left: {:?})",
                go_away.time_left
            );
        }

        let Some(content) = self.server_content else {
            return events;
        };

        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                match part.inline_data {
                    Some(blob) if blob.mime_type.starts_with("audio/pcm") => {
                        events.push(TransportEvent::Audio(blob.into()));
                    }
                    Some(blob) => {
                        log::debug!("Ignoring inline data of type {}", blob.mime_type);
                    }
                    None => {}
                }
            }
        }

        if content.interrupted {
            events.push(TransportEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(TransportEvent::TurnComplete);
        }

        events
    }
}
