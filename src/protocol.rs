//! Client <-> relay wire protocol.
//!
//! All messages are JSON text frames with snake_case fields. The client sends
//! one setup envelope after the link opens, then data envelopes carrying media
//! chunks. The relay answers with flat objects carrying any subset of `text`,
//! `audio` and `turn_complete`.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub const AUDIO_MIME: &str = "audio/pcm";
pub const IMAGE_MIME: &str = "image/jpeg";

/// Error type for wire parsing.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One media chunk inside a data envelope.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

impl MediaChunk {
    pub fn audio(data: String) -> Self {
        Self {
            mime_type: AUDIO_MIME.to_string(),
            data,
        }
    }

    pub fn image(data: String) -> Self {
        Self {
            mime_type: IMAGE_MIME.to_string(),
            data,
        }
    }
}

/// Payload of a data envelope. A send carries at most one audio and one
/// image chunk, so the list stays inline.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RealtimeInput {
    pub media_chunks: SmallVec<[MediaChunk; 2]>,
}

/// Generation settings declared in the setup handshake. The client only
/// fills `response_modalities`; the relay's defaults carry the rest.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_count: Option<u32>,
}

/// Setup payload, sent exactly once immediately after the link opens and
/// before any data envelope.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SessionSetup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

impl SessionSetup {
    /// The handshake the client declares: audio and text responses.
    pub fn audio_and_text() -> Self {
        Self {
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["AUDIO".to_string(), "TEXT".to_string()],
                temperature: None,
                candidate_count: None,
            }),
        }
    }
}

/// Messages the client sends to the relay.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum ClientMessage {
    Setup { setup: SessionSetup },
    Data { realtime_input: RealtimeInput },
}

impl ClientMessage {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A normalized relay message. Fields are independent; any subset may be
/// present, and a message with none is valid but inert. Unrecognized fields
/// are ignored.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ServerEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_complete: Option<bool>,
}

impl ServerEvent {
    /// Parse a raw text frame. Malformed payloads surface as a typed error
    /// for the caller to log and drop.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// True when no recognized field is present.
    pub fn is_inert(&self) -> bool {
        self.text.is_none() && self.audio.is_none() && self.turn_complete.is_none()
    }
}
