//! Wire format of the translation backend.
//!
//! Every frame in both directions is a JSON object with a `message_type`
//! discriminator and a `data` payload.

use crate::config::UpstreamConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Frames the relay sends to the backend.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "message_type", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// One-time pipeline configuration, sent right after connecting.
    SetTask(Value),
    /// Opaque input payload (an audio chunk or an encoded text request).
    InputAudioData { data: String },
    /// Graceful end of the backend task before closing the socket.
    EndTask { force: bool },
}

/// A text-to-translate request. The backend has no dedicated text channel,
/// so it travels JSON-encoded inside an `input_audio_data` frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextRequest {
    pub text: String,
    pub source_language: String,
    pub target_language: String,
}

impl OutboundMessage {
    pub fn set_task(config: &UpstreamConfig) -> Self {
        OutboundMessage::SetTask(json!({
            "input_stream": {
                "content_type": "audio",
                "source": {
                    "type": "ws",
                    "format": config.audio_format,
                    "sample_rate": config.sample_rate,
                    "channels": config.channels
                }
            },
            "output_stream": {
                "content_type": "audio",
                "target": {
                    "type": "ws",
                    "format": config.audio_format
                }
            },
            "pipeline": {
                "preprocessing": {},
                "transcription": {
                    "source_language": config.source_language
                },
                "translations": [{
                    "target_language": config.target_language,
                    "speech_generation": {}
                }]
            }
        }))
    }

    pub fn audio(data: impl Into<String>) -> Self {
        OutboundMessage::InputAudioData { data: data.into() }
    }

    pub fn text(request: &TextRequest) -> Result<Self, serde_json::Error> {
        Ok(OutboundMessage::InputAudioData {
            data: serde_json::to_string(request)?,
        })
    }

    pub fn end_task() -> Self {
        OutboundMessage::EndTask { force: false }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Frames the backend sends to the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamMessage {
    PartialTranscription { text: String, language: String },
    FinalTranscription { text: String, language: String },
    Translation { text: String, target_language: String },
    /// Any other `message_type`; logged and dropped.
    Other { message_type: String },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    message_type: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct TranscriptionData {
    transcription: TranscriptionSegment,
}

#[derive(Deserialize)]
struct TranscriptionSegment {
    text: String,
    language: String,
}

#[derive(Deserialize)]
struct TranslationData {
    text: String,
    target_language: String,
}

impl UpstreamMessage {
    /// Parse one text frame. Recognized types with a malformed `data` payload
    /// are errors; unknown types are not.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let envelope: Envelope = serde_json::from_str(raw)?;

        let message = match envelope.message_type.as_str() {
            "partial_transcription" => {
                let data: TranscriptionData = serde_json::from_value(envelope.data)?;
                UpstreamMessage::PartialTranscription {
                    text: data.transcription.text,
                    language: data.transcription.language,
                }
            }
            "final_transcription" => {
                let data: TranscriptionData = serde_json::from_value(envelope.data)?;
                UpstreamMessage::FinalTranscription {
                    text: data.transcription.text,
                    language: data.transcription.language,
                }
            }
            "translation" => {
                let data: TranslationData = serde_json::from_value(envelope.data)?;
                UpstreamMessage::Translation {
                    text: data.text,
                    target_language: data.target_language,
                }
            }
            _ => UpstreamMessage::Other {
                message_type: envelope.message_type,
            },
        };

        Ok(message)
    }
}
