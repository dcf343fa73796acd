//! Text-to-speech client for the Edge neural voice websocket service.
//!
//! One synthesis call opens a socket, sends a `speech.config` frame and an
//! SSML frame, then collects binary audio frames until the service signals
//! `turn.end`. The complete MP3 artifact is returned as one buffer; the
//! caller decides how to deliver it. Partial delivery is treated as a
//! failure, never surfaced to the client.

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Edge neural TTS websocket endpoint (without the connection id).
pub const EDGE_TTS_URL: &str =
    "wss://speech.platform.bing.com/consumer/speech/synthesize/readaloud/edge/v1";

/// Client token the readaloud endpoint expects in the query string.
const TRUSTED_CLIENT_TOKEN: &str = "6A5AA1D4EAFF4E9FB37E23D68491D6F4";

/// Output container requested from the service.
const OUTPUT_FORMAT: &str = "audio-24khz-48kbitrate-mono-mp3";

/// Budget for the websocket handshake alone.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced by the TTS client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TtsError {
    /// Transport or upstream failure
    #[error("synthesis failed: {0}")]
    Failed(String),

    /// The service completed the turn without producing audio
    #[error("synthesis produced no audio")]
    Empty,

    /// The call exceeded its budget
    #[error("synthesis timed out")]
    Timeout,
}

impl TtsError {
    /// Short machine-readable label, surfaced to clients in `error`
    /// messages.
    pub fn kind(&self) -> &'static str {
        match self {
            TtsError::Failed(_) => "SynthesisFailed",
            TtsError::Empty => "SynthesisEmpty",
            TtsError::Timeout => "Timeout",
        }
    }
}

/// A completed synthesis artifact.
#[derive(Debug, Clone)]
pub struct TtsAudio {
    /// The complete audio payload
    pub data: Bytes,
    /// Container type of `data`, for tagging the client-bound frame
    pub container: &'static str,
}

/// Prosody adjustments applied to the synthesized voice.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prosody {
    /// Rate offset in percent (e.g. 10 means "+10%")
    pub rate_percent: i32,
    /// Pitch offset in Hz
    pub pitch_hz: i32,
}

/// Synthesis client. Cheap to clone; every call opens its own socket.
#[derive(Clone)]
pub struct TtsClient {
    endpoint: String,
    timeout: Duration,
    prosody: Prosody,
}

impl TtsClient {
    /// Create a client with the given per-call budget.
    pub fn new(timeout: Duration) -> Self {
        Self {
            endpoint: EDGE_TTS_URL.to_string(),
            timeout,
            prosody: Prosody::default(),
        }
    }

    /// Override the endpoint (used by tests against a local mock).
    pub fn with_endpoint(mut self, endpoint: String) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Set prosody adjustments for subsequent calls.
    pub fn with_prosody(mut self, prosody: Prosody) -> Self {
        self.prosody = prosody;
        self
    }

    /// Synthesize `text` with the given neural voice.
    ///
    /// All audio bytes are collected before returning; a turn that ends
    /// with zero bytes is [`TtsError::Empty`].
    pub async fn synthesize(&self, text: &str, voice: &str) -> Result<TtsAudio, TtsError> {
        if text.trim().is_empty() {
            return Err(TtsError::Empty);
        }

        match timeout(self.timeout, self.run_turn(text, voice)).await {
            Ok(result) => result,
            Err(_) => Err(TtsError::Timeout),
        }
    }

    async fn run_turn(&self, text: &str, voice: &str) -> Result<TtsAudio, TtsError> {
        let connection_id = Uuid::new_v4().simple().to_string();
        let url = format!(
            "{}?TrustedClientToken={}&ConnectionId={}",
            self.endpoint, TRUSTED_CLIENT_TOKEN, connection_id
        );

        let (ws_stream, _response) = timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| TtsError::Failed("connect timeout".to_string()))?
            .map_err(|e| TtsError::Failed(e.to_string()))?;

        let (mut ws_sink, mut ws_source) = ws_stream.split();

        ws_sink
            .send(Message::Text(speech_config_frame().into()))
            .await
            .map_err(|e| TtsError::Failed(format!("failed to send speech config: {e}")))?;

        let request_id = Uuid::new_v4().simple().to_string();
        let ssml = build_ssml(text, voice, self.prosody);
        ws_sink
            .send(Message::Text(ssml_frame(&request_id, &ssml).into()))
            .await
            .map_err(|e| TtsError::Failed(format!("failed to send SSML: {e}")))?;

        debug!(voice, chars = text.len(), "synthesis turn started");

        let mut audio = BytesMut::new();

        while let Some(message) = ws_source.next().await {
            match message {
                Ok(Message::Binary(frame)) => {
                    if let Some(payload) = audio_payload(&frame) {
                        audio.extend_from_slice(payload);
                    }
                }
                Ok(Message::Text(text_frame)) => {
                    if text_frame.contains("Path:turn.end") {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        if audio.is_empty() {
                            return Err(TtsError::Empty);
                        }
                        info!(bytes = audio.len(), "synthesis turn complete");
                        return Ok(TtsAudio {
                            data: audio.freeze(),
                            container: "mp3",
                        });
                    }
                    // turn.start / response frames carry no audio
                    debug!("TTS control frame");
                }
                Ok(Message::Close(frame)) => {
                    warn!("TTS socket closed before turn.end: {frame:?}");
                    return Err(TtsError::Failed(
                        "socket closed before turn completed".to_string(),
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(TtsError::Failed(e.to_string()));
                }
            }
        }

        Err(TtsError::Failed(
            "socket ended before turn completed".to_string(),
        ))
    }
}

/// The `speech.config` frame selecting the output container.
fn speech_config_frame() -> String {
    format!(
        "Content-Type:application/json; charset=utf-8\r\nPath:speech.config\r\n\r\n\
         {{\"context\":{{\"synthesis\":{{\"audio\":{{\"metadataoptions\":\
         {{\"sentenceBoundaryEnabled\":\"false\",\"wordBoundaryEnabled\":\"false\"}},\
         \"outputFormat\":\"{OUTPUT_FORMAT}\"}}}}}}}}"
    )
}

/// Wrap SSML in the request frame headers.
fn ssml_frame(request_id: &str, ssml: &str) -> String {
    format!(
        "X-RequestId:{request_id}\r\nContent-Type:application/ssml+xml\r\nPath:ssml\r\n\r\n{ssml}"
    )
}

/// Build the SSML document for one turn.
fn build_ssml(text: &str, voice: &str, prosody: Prosody) -> String {
    format!(
        "<speak version='1.0' xmlns='http://www.w3.org/2001/10/synthesis' xml:lang='en-US'>\
         <voice name='{voice}'>\
         <prosody pitch='{pitch:+}Hz' rate='{rate:+}%' volume='+0%'>{text}</prosody>\
         </voice></speak>",
        voice = voice,
        pitch = prosody.pitch_hz,
        rate = prosody.rate_percent,
        text = escape_xml(text),
    )
}

/// Escape the characters SSML cannot carry verbatim.
fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\'' => escaped.push_str("&apos;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Extract the audio payload from a binary service frame.
///
/// Binary frames carry a big-endian u16 header length, the header text,
/// then the payload. Only frames whose header declares `Path:audio` carry
/// audio bytes.
fn audio_payload(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < 2 {
        return None;
    }
    let header_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    let payload_start = 2 + header_len;
    if frame.len() < payload_start {
        return None;
    }
    let header = std::str::from_utf8(&frame[2..payload_start]).ok()?;
    if !header.contains("Path:audio") {
        return None;
    }
    Some(&frame[payload_start..])
}
