//! # Upstream Translation Backend
//!
//! Owns the single process-wide connection to the external speech
//! translation service.
//!
//! ## Key Components:
//! - **link**: supervised connect / configure / receive / reconnect loop
//! - **protocol**: `message_type`-tagged JSON frames in both directions
//! - **session**: HTTP session creation that yields the socket URL and token
//!
//! ## Connection Lifecycle:
//! `Disconnected → Connecting → Configuring → Ready → Disconnected`, then a
//! fixed delay and around again for as long as the process runs.

pub mod link;
pub mod protocol;
pub mod session;

pub use link::UpstreamLink;
pub use protocol::{TextRequest, UpstreamMessage};

use serde::Serialize;
use std::fmt;

/// Connection state of the upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    /// Socket open, pipeline configuration not yet sent.
    Configuring,
    Ready,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Configuring => "configuring",
            LinkState::Ready => "ready",
        }
    }
}

/// What the link reports to its handler.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The link reached `Ready` on a fresh connection.
    Connected,
    /// The current connection is gone; anything sent on it will not be answered.
    Disconnected,
    /// A backend message worth routing (final transcriptions and translations).
    Message(UpstreamMessage),
}

/// Receiver of upstream events. Exactly one is installed at a time and it is
/// called from the link's receive task in arrival order, so implementations
/// must not block.
pub trait UpstreamHandler: Send + Sync {
    fn handle(&self, event: LinkEvent);
}

/// Errors raised by the upstream link.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamError {
    /// No open connection to write on.
    NotConnected,
    /// The HTTP session-creation call failed.
    SessionCreation(String),
    /// The WebSocket handshake failed or timed out.
    Connect(String),
    /// A frame could not be written (or the write timed out).
    SendFailed(String),
    /// A frame could not be encoded.
    Encode(String),
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::NotConnected => write!(f, "translation backend is not connected"),
            UpstreamError::SessionCreation(msg) => write!(f, "session creation failed: {}", msg),
            UpstreamError::Connect(msg) => write!(f, "connection failed: {}", msg),
            UpstreamError::SendFailed(msg) => write!(f, "send failed: {}", msg),
            UpstreamError::Encode(msg) => write!(f, "encoding failed: {}", msg),
        }
    }
}

impl std::error::Error for UpstreamError {}
