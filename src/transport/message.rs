//! JSON envelopes exchanged with the voice service.
//!
//! Every frame on the socket is a JSON object with a `"type"` field.  The
//! [`Envelope`] enum is internally tagged on that field; kinds this client
//! does not know deserialize to [`Envelope::Unknown`] and are ignored by the
//! subscribers instead of failing the connection.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::BeginMessage;

// ---------------------------------------------------------------------------
// AudioFormat
// ---------------------------------------------------------------------------

/// Sub-encoding tag carried by `audio_chunk` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// Raw 16-bit signed little-endian PCM (what this client sends).
    Pcm16,
    /// Raw PCM as labelled by the service.
    Pcm,
    /// RIFF/WAVE container.
    Wav,
    /// MPEG layer III.
    Mp3,
    /// Missing or unrecognised tag.
    #[default]
    #[serde(other)]
    Unknown,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One message on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Ask the server to open the upstream voice session.
    ConnectElevenlabs { context: String, language: String },
    /// Alternate spelling of the begin-session request.
    BeginSession { context: String, language: String },
    /// Ask the server to end the current conversation.
    EndConversation,
    /// Base64 audio, in both directions.
    AudioChunk {
        audio: String,
        #[serde(default)]
        format: AudioFormat,
    },
    /// Server is opening the upstream session.
    ElevenlabsConnecting,
    /// Upstream session is ready; audio may flow.
    ElevenlabsConnected {
        #[serde(rename = "conversationId", default)]
        conversation_id: Option<String>,
    },
    /// Upstream session ended.
    ElevenlabsDisconnected,
    /// Server accepted an audio chunk.
    AudioQueued,
    /// Transcript of what the user said.
    UserTranscript {
        #[serde(default)]
        text: String,
    },
    /// Text of the agent's reply.
    AiResponse {
        #[serde(default)]
        text: String,
    },
    /// Server-reported failure.
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl Envelope {
    /// Build the begin-session control envelope selected in config.
    pub fn begin(kind: BeginMessage, context: &str, language: &str) -> Self {
        let context = context.to_string();
        let language = language.to_string();
        match kind {
            BeginMessage::ConnectElevenlabs => Envelope::ConnectElevenlabs { context, language },
            BeginMessage::BeginSession => Envelope::BeginSession { context, language },
        }
    }

    /// Wrap little-endian PCM16 bytes as an outbound `audio_chunk`.
    pub fn pcm16_audio(pcm: &[u8]) -> Self {
        Envelope::AudioChunk {
            audio: base64::engine::general_purpose::STANDARD.encode(pcm),
            format: AudioFormat::Pcm16,
        }
    }

    /// Wire name of this envelope's kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::ConnectElevenlabs { .. } => "connect_elevenlabs",
            Envelope::BeginSession { .. } => "begin_session",
            Envelope::EndConversation => "end_conversation",
            Envelope::AudioChunk { .. } => "audio_chunk",
            Envelope::ElevenlabsConnecting => "elevenlabs_connecting",
            Envelope::ElevenlabsConnected { .. } => "elevenlabs_connected",
            Envelope::ElevenlabsDisconnected => "elevenlabs_disconnected",
            Envelope::AudioQueued => "audio_queued",
            Envelope::UserTranscript { .. } => "user_transcript",
            Envelope::AiResponse { .. } => "ai_response",
            Envelope::Error { .. } => "error",
            Envelope::Unknown => "unknown",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
