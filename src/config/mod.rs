//! Configuration module for the polyglot gateway.
//!
//! All configuration is read once from environment variables at startup
//! (after an optional `.env` load) and is immutable afterwards. Session
//! code receives the config behind an `Arc` and never mutates it.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::hub::OverflowPolicy;

/// TLS configuration for HTTPS and WSS
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM format)
    pub cert_path: PathBuf,
    /// Path to the TLS private key file (PEM format)
    pub key_path: PathBuf,
}

/// Server configuration
///
/// Contains everything needed to run the gateway: listen address, optional
/// TLS material, upstream credentials, and the timing knobs of the session
/// state machines.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // TLS configuration (optional)
    pub tls: Option<TlsConfig>,

    // Upstream credentials
    /// Deepgram API key for streaming speech-to-text
    pub stt_api_key: String,
    /// Groq API key for the translation chat-completion calls
    pub llm_api_key: String,

    // STT stream tuning
    /// Silence gap (ms) after which Deepgram emits `UtteranceEnd`
    pub utterance_end_ms: u32,
    /// Endpointing gap (ms) controlling `speech_final`
    pub endpointing_ms: u32,

    // Session timing
    /// Trailing window after a `stop` during which late audio frames are
    /// still forwarded to STT before Finalize is issued
    pub stop_grace: Duration,
    /// Budget for translate + synthesize after the stop signal
    pub hard_ceiling: Duration,
    /// Per-call translator budget
    pub translate_timeout: Duration,
    /// Per-call synthesis budget
    pub tts_timeout: Duration,

    // Fan-out hub
    /// Per-subscriber queue depth
    pub subscriber_queue: usize,
    /// Queue overflow policy
    pub overflow_policy: OverflowPolicy,

    // Connection limits
    /// Maximum concurrent conversation sessions
    pub max_sessions: usize,
    /// Maximum concurrent broadcast subscribers
    pub max_subscribers: usize,

    // Security
    /// CORS allowed origins (comma-separated list or "*" for all);
    /// None means same-origin only
    pub cors_allowed_origins: Option<String>,
}

/// Zeroize upstream credentials when the config is dropped so the keys do
/// not linger in freed memory.
impl Drop for GatewayConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        self.stt_api_key.zeroize();
        self.llm_api_key.zeroize();
    }
}

/// Configuration loading / validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("TLS requires both TLS_CERT and TLS_KEY to be set")]
    PartialTls,
}

fn optional(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::MissingVar(name))
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            name,
            value: raw,
        }),
        None => Ok(default),
    }
}

fn duration_ms_or(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(parse_or(name, default_ms)?))
}

impl GatewayConfig {
    /// Load configuration from environment variables.
    ///
    /// `STT_API_KEY` and `LLM_API_KEY` are required; everything else has a
    /// default. Call `dotenvy::dotenv()` before this if a `.env` file
    /// should be honored.
    pub fn from_env() -> Result<Self, ConfigError> {
        let tls = match (optional("TLS_CERT"), optional("TLS_KEY")) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            }),
            (None, None) => None,
            _ => return Err(ConfigError::PartialTls),
        };

        let overflow_policy = match optional("OVERFLOW_POLICY").as_deref() {
            None | Some("drop-oldest") => OverflowPolicy::DropOldest,
            Some("disconnect") => OverflowPolicy::Disconnect,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    name: "OVERFLOW_POLICY",
                    value: other.to_string(),
                });
            }
        };

        let config = Self {
            host: optional("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or("PORT", 5050)?,
            tls,
            stt_api_key: required("STT_API_KEY")?,
            llm_api_key: required("LLM_API_KEY")?,
            utterance_end_ms: parse_or("UTTERANCE_END_MS", 1000)?,
            endpointing_ms: parse_or("ENDPOINTING_MS", 300)?,
            stop_grace: duration_ms_or("STOP_GRACE_MS", 700)?,
            hard_ceiling: duration_ms_or("HARD_CEILING_MS", 15_000)?,
            translate_timeout: duration_ms_or("TRANSLATE_TIMEOUT_MS", 4_000)?,
            tts_timeout: duration_ms_or("TTS_TIMEOUT_MS", 8_000)?,
            subscriber_queue: parse_or("SUBSCRIBER_QUEUE", 32)?,
            overflow_policy,
            max_sessions: parse_or("MAX_SESSIONS", 32)?,
            max_subscribers: parse_or("MAX_SUBSCRIBERS", 64)?,
            cors_allowed_origins: optional("CORS_ALLOWED_ORIGINS"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.utterance_end_ms < 500 {
            return Err(ConfigError::InvalidValue {
                name: "UTTERANCE_END_MS",
                value: self.utterance_end_ms.to_string(),
            });
        }
        if self.subscriber_queue == 0 {
            return Err(ConfigError::InvalidValue {
                name: "SUBSCRIBER_QUEUE",
                value: "0".to_string(),
            });
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::InvalidValue {
                name: "MAX_SESSIONS",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// The socket address string to bind to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether TLS termination is enabled.
    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// A config suitable for unit tests: loopback, dummy keys, spec defaults.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            tls: None,
            stt_api_key: "test-stt-key".to_string(),
            llm_api_key: "test-llm-key".to_string(),
            utterance_end_ms: 1000,
            endpointing_ms: 300,
            stop_grace: Duration::from_millis(700),
            hard_ceiling: Duration::from_millis(15_000),
            translate_timeout: Duration::from_millis(4_000),
            tts_timeout: Duration::from_millis(8_000),
            subscriber_queue: 32,
            overflow_policy: OverflowPolicy::DropOldest,
            max_sessions: 32,
            max_subscribers: 64,
            cors_allowed_origins: None,
        }
    }
}
