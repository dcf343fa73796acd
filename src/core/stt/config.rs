//! Stream options and websocket URL construction for the Deepgram
//! listen API.

use super::SttError;

/// Default websocket endpoint for streaming recognition.
pub const DEEPGRAM_LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";

/// Host name used for the upgrade request headers.
pub const DEEPGRAM_HOST: &str = "api.deepgram.com";

/// Options negotiated when opening a streaming recognition socket.
///
/// Audio payloads are opaque to the gateway. When `encoding` is unset the
/// service auto-detects containerized audio (WebM/Opus from browsers);
/// raw PCM publishers must set both `encoding` and `sample_rate`.
#[derive(Debug, Clone)]
pub struct SttOptions {
    /// Deepgram API key
    pub api_key: String,
    /// Recognition model (e.g. "nova-2", "nova-3")
    pub model: String,
    /// BCP-47 language tag (e.g. "en-US", "zh-CN")
    pub language: String,
    /// Emit interim (non-final) results
    pub interim_results: bool,
    /// Apply smart formatting to transcripts
    pub smart_format: bool,
    /// Add punctuation
    pub punctuate: bool,
    /// Silence gap (ms) after which `UtteranceEnd` is emitted
    pub utterance_end_ms: u32,
    /// Endpointing gap (ms) controlling `speech_final`
    pub endpointing_ms: u32,
    /// Emit `SpeechStarted` voice-activity events
    pub vad_events: bool,
    /// Audio channel count
    pub channels: u32,
    /// Raw audio encoding (e.g. "linear16"); None for containerized audio
    pub encoding: Option<String>,
    /// Sample rate in Hz; only meaningful with `encoding`
    pub sample_rate: Option<u32>,
    /// Override the websocket endpoint (used by tests against a local mock)
    pub endpoint: Option<String>,
}

impl Default for SttOptions {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "nova-2".to_string(),
            language: "en-US".to_string(),
            interim_results: true,
            smart_format: true,
            punctuate: true,
            utterance_end_ms: 1000,
            endpointing_ms: 300,
            vad_events: true,
            channels: 1,
            encoding: None,
            sample_rate: None,
            endpoint: None,
        }
    }
}

impl SttOptions {
    /// Reject option combinations the service would refuse.
    pub fn validate(&self) -> Result<(), SttError> {
        if self.api_key.is_empty() {
            return Err(SttError::Config("API key is required".to_string()));
        }
        if self.model.is_empty() {
            return Err(SttError::Config("model is required".to_string()));
        }
        if self.encoding.is_some() && self.sample_rate.is_none() {
            return Err(SttError::Config(
                "sample_rate is required when encoding is set".to_string(),
            ));
        }
        if self.channels == 0 {
            return Err(SttError::Config("channels must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Build the full websocket URL with query parameters.
    pub fn build_websocket_url(&self) -> String {
        let base = self.endpoint.as_deref().unwrap_or(DEEPGRAM_LISTEN_URL);

        let mut url = String::with_capacity(256);
        url.push_str(base);

        url.push_str("?model=");
        url.push_str(&self.model);

        url.push_str("&language=");
        url.push_str(&self.language);

        url.push_str("&smart_format=");
        url.push_str(if self.smart_format { "true" } else { "false" });

        url.push_str("&punctuate=");
        url.push_str(if self.punctuate { "true" } else { "false" });

        url.push_str("&interim_results=");
        url.push_str(if self.interim_results { "true" } else { "false" });

        url.push_str("&utterance_end_ms=");
        url.push_str(&self.utterance_end_ms.to_string());

        url.push_str("&endpointing=");
        url.push_str(&self.endpointing_ms.to_string());

        url.push_str("&vad_events=");
        url.push_str(if self.vad_events { "true" } else { "false" });

        url.push_str("&channels=");
        url.push_str(&self.channels.to_string());

        if let Some(ref encoding) = self.encoding {
            url.push_str("&encoding=");
            url.push_str(encoding);
            if let Some(rate) = self.sample_rate {
                url.push_str("&sample_rate=");
                url.push_str(&rate.to_string());
            }
        }

        url
    }
}
