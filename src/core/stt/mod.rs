//! Streaming speech-to-text client for the Deepgram listen API.
//!
//! One [`SttStream`] corresponds to one upstream websocket. Conversation
//! sessions open a fresh stream per utterance; the broadcast session keeps
//! a single stream alive for the lifetime of the publisher connection and
//! reopens it on fatal errors.

mod client;
mod config;
mod messages;

pub use client::SttStream;
pub use config::SttOptions;
pub use messages::{DeepgramMessage, FinalizeMessage, KeepAliveMessage, ResultsEvent};

/// Errors surfaced by the STT client.
///
/// `UpstreamProtocol` carries the websocket close code and the payload
/// code Deepgram puts in the close reason (`DATA-0000`, `NET-0000`, ...).
#[derive(Debug, Clone, thiserror::Error)]
pub enum SttError {
    /// Invalid stream options, rejected before connecting
    #[error("invalid STT options: {0}")]
    Config(String),

    /// The upstream service could not be reached or the socket broke
    #[error("STT service unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Non-normal close frame from the service
    #[error("STT protocol error ({code}): {reason}")]
    UpstreamProtocol { code: u16, reason: String },

    /// The service terminated the socket after prolonged silence
    #[error("STT stream idle timeout")]
    IdleTimeout,

    /// The local send buffer is full beyond the high-water mark
    #[error("STT send buffer full")]
    Backpressured,

    /// The stream has already been terminated
    #[error("STT stream closed")]
    Closed,
}

impl SttError {
    /// Short machine-readable label, surfaced to clients in `error`
    /// messages.
    pub fn kind(&self) -> &'static str {
        match self {
            SttError::Config(_) => "ConfigError",
            SttError::UpstreamUnavailable(_) => "UpstreamUnavailable",
            SttError::UpstreamProtocol { .. } => "UpstreamProtocol",
            SttError::IdleTimeout => "IdleTimeout",
            SttError::Backpressured => "Backpressured",
            SttError::Closed => "Closed",
        }
    }
}

/// A transcription event produced by the upstream service.
///
/// Events form a lazy, finite sequence per stream: the channel closes when
/// the upstream socket is torn down. A terminal [`TranscriptEvent::Error`]
/// precedes closure on any non-normal shutdown.
#[derive(Debug, Clone)]
pub enum TranscriptEvent {
    /// Best-guess transcript that later results may supersede
    Interim {
        text: String,
        channel: usize,
        /// End of the covered audio, seconds from stream start
        end: f64,
    },
    /// Committed transcript segment; concatenation of finals forms the
    /// translator input
    Final {
        text: String,
        channel: usize,
        end: f64,
        /// The endpointing heuristic considers the speaker done
        speech_final: bool,
        /// This final was flushed in response to a Finalize message
        from_finalize: bool,
    },
    /// Coarse silence-gap segmentation signal
    UtteranceEnd { last_word_end: f64 },
    /// Voice activity detected
    SpeechStarted { timestamp: f64 },
    /// Terminal error; the event channel closes after this
    Error(SttError),
}

impl TranscriptEvent {
    /// End timestamp of the event, where one applies.
    pub fn end_time(&self) -> Option<f64> {
        match self {
            TranscriptEvent::Interim { end, .. } | TranscriptEvent::Final { end, .. } => Some(*end),
            TranscriptEvent::UtteranceEnd { last_word_end } => Some(*last_word_end),
            TranscriptEvent::SpeechStarted { timestamp } => Some(*timestamp),
            TranscriptEvent::Error(_) => None,
        }
    }
}
