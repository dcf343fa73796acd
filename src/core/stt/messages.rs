//! Wire message types for the Deepgram listen websocket.
//!
//! Incoming frames are JSON text messages discriminated by a `type` field:
//! `Results`, `UtteranceEnd`, `SpeechStarted`, `Metadata`. Outgoing control
//! frames are `KeepAlive`, `Finalize`, and `CloseStream`. Audio itself is
//! sent as raw binary frames with no JSON wrapper.

use serde::{Deserialize, Serialize};

use super::SttError;

// =============================================================================
// Incoming Messages (Server to Client)
// =============================================================================

/// A word with timing information inside a transcript alternative.
#[derive(Debug, Clone, Deserialize)]
pub struct Word {
    /// The raw transcribed word
    pub word: String,
    /// Start time in seconds from the beginning of the stream
    pub start: f64,
    /// End time in seconds from the beginning of the stream
    pub end: f64,
    /// Confidence score (0.0 to 1.0)
    pub confidence: f64,
    /// The word with punctuation/formatting applied, when available
    #[serde(default)]
    pub punctuated_word: Option<String>,
}

/// One transcription hypothesis.
#[derive(Debug, Clone, Deserialize)]
pub struct Alternative {
    /// Transcript text; may be empty during silence
    pub transcript: String,
    /// Overall confidence for this alternative
    #[serde(default)]
    pub confidence: f64,
    /// Word-level detail
    #[serde(default)]
    pub words: Vec<Word>,
}

/// The channel payload of a `Results` event.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultsChannel {
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
}

/// Transcription results event.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultsEvent {
    /// [channel, total_channels]
    #[serde(default)]
    pub channel_index: Vec<usize>,
    /// Covered audio duration in seconds
    #[serde(default)]
    pub duration: f64,
    /// Start of the covered audio in seconds from stream start
    #[serde(default)]
    pub start: f64,
    /// The service commits to this transcript; it will not be revised
    #[serde(default)]
    pub is_final: bool,
    /// The endpointing heuristic considers the speaker done
    #[serde(default)]
    pub speech_final: bool,
    /// This result was flushed by a Finalize control message
    #[serde(default)]
    pub from_finalize: bool,
    pub channel: ResultsChannel,
}

impl ResultsEvent {
    /// The transcript of the best alternative, if any.
    pub fn transcript(&self) -> Option<&str> {
        self.channel.alternatives.first().map(|a| a.transcript.as_str())
    }

    /// Channel index of this result (0 for mono streams).
    pub fn channel(&self) -> usize {
        self.channel_index.first().copied().unwrap_or(0)
    }

    /// End of the covered audio in seconds from stream start.
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Utterance-end segmentation event.
#[derive(Debug, Clone, Deserialize)]
pub struct UtteranceEndEvent {
    /// End time of the last spoken word, seconds from stream start
    #[serde(default)]
    pub last_word_end: f64,
}

/// Voice-activity event.
#[derive(Debug, Clone, Deserialize)]
pub struct SpeechStartedEvent {
    #[serde(default)]
    pub timestamp: f64,
}

/// Stream metadata, sent once after `CloseStream` as the final event.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataEvent {
    #[serde(default)]
    pub request_id: String,
    /// Total processed audio duration in seconds
    #[serde(default)]
    pub duration: f64,
}

// =============================================================================
// Outgoing Messages (Client to Server)
// =============================================================================

/// Keepalive control message, sent during send-silence to stop the
/// service from terminating an idle socket.
#[derive(Debug, Clone, Serialize)]
pub struct KeepAliveMessage {
    #[serde(rename = "type")]
    pub message_type: &'static str,
}

impl Default for KeepAliveMessage {
    fn default() -> Self {
        Self {
            message_type: "KeepAlive",
        }
    }
}

/// Flush control message: the service finalizes everything buffered and
/// replies with a `Results` event carrying `from_finalize: true`.
#[derive(Debug, Clone, Serialize)]
pub struct FinalizeMessage {
    #[serde(rename = "type")]
    pub message_type: &'static str,
}

impl Default for FinalizeMessage {
    fn default() -> Self {
        Self {
            message_type: "Finalize",
        }
    }
}

/// Graceful shutdown: the service replies with a final `Metadata` event
/// and closes the socket normally.
#[derive(Debug, Clone, Serialize)]
pub struct CloseStreamMessage {
    #[serde(rename = "type")]
    pub message_type: &'static str,
}

impl Default for CloseStreamMessage {
    fn default() -> Self {
        Self {
            message_type: "CloseStream",
        }
    }
}

// =============================================================================
// Message Enum and Parsing
// =============================================================================

/// Any message the listen socket can deliver.
#[derive(Debug)]
pub enum DeepgramMessage {
    Results(ResultsEvent),
    UtteranceEnd(UtteranceEndEvent),
    SpeechStarted(SpeechStartedEvent),
    Metadata(MetadataEvent),
    /// Unknown message type, kept raw for forward compatibility
    Unknown(String),
}

impl DeepgramMessage {
    /// Parse a websocket text frame into the appropriate type.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        struct TypePeek {
            #[serde(rename = "type")]
            message_type: String,
        }

        let peek: TypePeek = serde_json::from_str(text)?;

        match peek.message_type.as_str() {
            "Results" => Ok(DeepgramMessage::Results(serde_json::from_str(text)?)),
            "UtteranceEnd" => Ok(DeepgramMessage::UtteranceEnd(serde_json::from_str(text)?)),
            "SpeechStarted" => Ok(DeepgramMessage::SpeechStarted(serde_json::from_str(text)?)),
            "Metadata" => Ok(DeepgramMessage::Metadata(serde_json::from_str(text)?)),
            _ => Ok(DeepgramMessage::Unknown(text.to_string())),
        }
    }
}

/// Translate a non-normal close frame into a local error kind.
///
/// The service encodes the failure in the close reason: `DATA-0000` for
/// unparseable audio, `NET-0000` / `NET-0001` for silence timeouts.
pub fn map_close_frame(code: u16, reason: &str) -> Option<SttError> {
    if code == 1000 {
        return None;
    }
    if reason.starts_with("NET-0000") || reason.starts_with("NET-0001") {
        return Some(SttError::IdleTimeout);
    }
    Some(SttError::UpstreamProtocol {
        code,
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_results_event() {
        let json = r#"{
            "type": "Results",
            "channel_index": [0, 1],
            "duration": 1.5,
            "start": 2.0,
            "is_final": true,
            "speech_final": true,
            "channel": {
                "alternatives": [{
                    "transcript": "hello world",
                    "confidence": 0.97,
                    "words": [
                        {"word": "hello", "start": 2.0, "end": 2.5, "confidence": 0.98},
                        {"word": "world", "start": 2.5, "end": 3.1, "confidence": 0.96, "punctuated_word": "world."}
                    ]
                }]
            }
        }"#;

        let msg = DeepgramMessage::parse(json).unwrap();
        match msg {
            DeepgramMessage::Results(results) => {
                assert_eq!(results.transcript(), Some("hello world"));
                assert_eq!(results.channel(), 0);
                assert!(results.is_final);
                assert!(results.speech_final);
                assert!(!results.from_finalize);
                assert!((results.end() - 3.5).abs() < f64::EPSILON);
                assert_eq!(results.channel.alternatives[0].words.len(), 2);
            }
            _ => panic!("Expected Results message"),
        }
    }

    #[test]
    fn test_parse_results_from_finalize() {
        let json = r#"{
            "type": "Results",
            "is_final": true,
            "from_finalize": true,
            "channel": {"alternatives": [{"transcript": ""}]}
        }"#;

        let msg = DeepgramMessage::parse(json).unwrap();
        match msg {
            DeepgramMessage::Results(results) => {
                assert!(results.from_finalize);
                assert_eq!(results.transcript(), Some(""));
            }
            _ => panic!("Expected Results message"),
        }
    }

    #[test]
    fn test_parse_utterance_end() {
        let json = r#"{"type":"UtteranceEnd","channel":[0,1],"last_word_end":7.25}"#;
        let msg = DeepgramMessage::parse(json).unwrap();
        match msg {
            DeepgramMessage::UtteranceEnd(event) => {
                assert!((event.last_word_end - 7.25).abs() < f64::EPSILON);
            }
            _ => panic!("Expected UtteranceEnd message"),
        }
    }

    #[test]
    fn test_parse_speech_started() {
        let json = r#"{"type":"SpeechStarted","channel":[0,1],"timestamp":3.4}"#;
        let msg = DeepgramMessage::parse(json).unwrap();
        assert!(matches!(msg, DeepgramMessage::SpeechStarted(_)));
    }

    #[test]
    fn test_parse_metadata() {
        let json = r#"{"type":"Metadata","request_id":"req-1","duration":12.4,"channels":1}"#;
        let msg = DeepgramMessage::parse(json).unwrap();
        match msg {
            DeepgramMessage::Metadata(meta) => {
                assert_eq!(meta.request_id, "req-1");
            }
            _ => panic!("Expected Metadata message"),
        }
    }

    #[test]
    fn test_parse_unknown_message() {
        let json = r#"{"type":"FutureMessageType","data":"something"}"#;
        let msg = DeepgramMessage::parse(json).unwrap();
        assert!(matches!(msg, DeepgramMessage::Unknown(_)));
    }

    #[test]
    fn test_control_message_serialization() {
        assert_eq!(
            serde_json::to_string(&KeepAliveMessage::default()).unwrap(),
            r#"{"type":"KeepAlive"}"#
        );
        assert_eq!(
            serde_json::to_string(&FinalizeMessage::default()).unwrap(),
            r#"{"type":"Finalize"}"#
        );
        assert_eq!(
            serde_json::to_string(&CloseStreamMessage::default()).unwrap(),
            r#"{"type":"CloseStream"}"#
        );
    }

    #[test]
    fn test_map_close_frame_normal() {
        assert!(map_close_frame(1000, "").is_none());
    }

    #[test]
    fn test_map_close_frame_idle_timeout() {
        assert!(matches!(
            map_close_frame(1011, "NET-0000"),
            Some(SttError::IdleTimeout)
        ));
        assert!(matches!(
            map_close_frame(1011, "NET-0001"),
            Some(SttError::IdleTimeout)
        ));
    }

    #[test]
    fn test_map_close_frame_protocol_error() {
        match map_close_frame(1008, "DATA-0000") {
            Some(SttError::UpstreamProtocol { code, reason }) => {
                assert_eq!(code, 1008);
                assert_eq!(reason, "DATA-0000");
            }
            other => panic!("Expected UpstreamProtocol, got {other:?}"),
        }
    }
}
