//! JSON envelopes exchanged with browser clients.
//!
//! Every frame is an object discriminated by `type`. The server sends
//! `CONNECTION_ESTABLISHED`, `TRANSLATION_RESULT` and `ERROR`; the only client
//! request is `TRANSLATE`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Frames sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEnvelope {
    ConnectionEstablished {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    TranslationResult {
        original_text: String,
        translated_text: String,
        timestamp: String,
    },
    Error {
        message: String,
    },
}

impl ServerEnvelope {
    pub fn connected() -> Self {
        ServerEnvelope::ConnectionEstablished {
            message: "Connected successfully".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEnvelope::Error {
            message: message.into(),
        }
    }
}

/// A `TRANSLATE` request. All four fields are required.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateRequest {
    pub original_text: String,
    pub source_lang: String,
    pub target_lang: String,
    /// Opaque to the relay; echoed back with the result.
    pub timestamp: String,
}

/// A parsed client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Translate(TranslateRequest),
    /// Any other `type`; ignored by the gateway.
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestError {
    Malformed(String),
    MissingType,
    InvalidTranslate(String),
    EmptyText,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Malformed(msg) => write!(f, "Invalid JSON: {}", msg),
            RequestError::MissingType => write!(f, "Message has no type"),
            RequestError::InvalidTranslate(msg) => write!(f, "Invalid translation request: {}", msg),
            RequestError::EmptyText => write!(f, "Invalid translation request: originalText is empty"),
        }
    }
}

impl std::error::Error for RequestError {}

impl ClientRequest {
    pub fn parse(raw: &str) -> Result<Self, RequestError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| RequestError::Malformed(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(RequestError::MissingType)?;

        if kind != "TRANSLATE" {
            return Ok(ClientRequest::Unsupported(kind.to_string()));
        }

        let request: TranslateRequest = serde_json::from_value(value)
            .map_err(|e| RequestError::InvalidTranslate(e.to_string()))?;

        if request.original_text.trim().is_empty() {
            return Err(RequestError::EmptyText);
        }

        Ok(ClientRequest::Translate(request))
    }
}
