//! Client websocket message types.
//!
//! The browser protocol is a small tagged-variant surface shared by both
//! operating modes. Binary frames carry audio in both directions and are
//! not represented here. Unknown inbound tags are logged and ignored by
//! the handlers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Maximum accepted size for a client text message (4 KB). Control
/// messages are tiny; anything larger is a misbehaving client.
pub const MAX_CONTROL_MESSAGE_SIZE: usize = 4 * 1024;

// =============================================================================
// Incoming Messages (Client -> Server)
// =============================================================================

/// Text messages a client may send.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// End of push-to-talk (conversation) or kill-the-broadcast (broadcast)
    Stop,
    /// Application-level liveness probe; answered with `pong`
    Ping,
    /// Shared playback volume control, relayed to every subscriber
    Volume { value: f32 },
}

impl ClientMessage {
    /// Parse a client text frame. Oversized frames and unknown tags are
    /// rejected with a description for the log line.
    pub fn parse(text: &str) -> Result<Self, String> {
        if text.len() > MAX_CONTROL_MESSAGE_SIZE {
            return Err(format!("control message too large: {} bytes", text.len()));
        }
        serde_json::from_str(text).map_err(|e| e.to_string())
    }
}

// =============================================================================
// Outgoing Messages (Server -> Client)
// =============================================================================

/// Text messages the server sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Growing transcript of the utterance being recorded
    TranscriptionUpdate { text: String },
    /// One completed translation pair
    Translation { original: String, translation: String },
    /// Human-readable state change (broadcast mode)
    Status { message: String },
    /// Short machine-readable error kind, user-visible
    Error { message: String },
    /// Reply to a client `ping`
    Pong,
    /// Relayed volume control
    Volume { value: f32 },
}

impl ServerMessage {
    /// Serialize for the wire. Infallible for these shapes.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("server message serializes")
    }
}

/// Frames routed to a client egress task.
#[derive(Debug)]
pub enum Outbound {
    /// JSON text message
    Message(ServerMessage),
    /// Binary audio payload
    Audio(Bytes),
    /// Close the socket after flushing
    Close,
}
