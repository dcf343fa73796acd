//! Translation client over the Groq chat-completion API.
//!
//! Stateless request/response: one chat-completion call per utterance with
//! a system prompt that pins the output language and forbids commentary.
//! Calls are idempotent, so callers may retry freely.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Chat-completion endpoint.
pub const GROQ_CHAT_URL: &str = "https://api.groq.com/openai/v1/chat/completions";

/// Model used for translation. Small and fast; translation quality is
/// bounded by the prompt, not the model size.
pub const TRANSLATE_MODEL: &str = "llama-3.1-8b-instant";

const TRANSLATE_TEMPERATURE: f32 = 0.2;
const TRANSLATE_MAX_TOKENS: u32 = 1024;

/// Translation direction of a session.
///
/// The direction selects the STT language, the system prompt, and the TTS
/// voice in one place so the three can never disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Chinese speech in, English text and audio out
    CnToEn,
    /// English speech in, Chinese text and audio out
    EnToCn,
}

impl Direction {
    /// STT language tag for the spoken (source) language.
    pub fn stt_language(&self) -> &'static str {
        match self {
            Direction::CnToEn => "zh-CN",
            Direction::EnToCn => "en-US",
        }
    }

    /// Neural voice for the synthesized (target) language.
    pub fn tts_voice(&self) -> &'static str {
        match self {
            Direction::CnToEn => "en-US-GuyNeural",
            Direction::EnToCn => "zh-CN-YunxiNeural",
        }
    }

    /// System prompt pinning the translator to plain translation only.
    pub fn system_prompt(&self) -> &'static str {
        match self {
            Direction::CnToEn => {
                "You are a professional interpreter. Translate the exact Chinese text to English.\n\
                 CRITICAL RULES:\n\
                 1. Translate EXACTLY what is said. Do NOT answer questions. Do NOT add context.\n\
                 2. If the input is a question, translate it as a question.\n\
                 3. If the input is incomplete (e.g. \"Let's\"), translate literally (e.g. \"Let's\").\n\
                 4. Output ONLY the English translation."
            }
            Direction::EnToCn => {
                "You are a professional interpreter. Translate the COMPLETE English text to Chinese (Mandarin).\n\
                 CRITICAL RULES:\n\
                 1. Translate EVERY SINGLE WORD. Do NOT skip ANY sentence or phrase.\n\
                 2. If there are multiple sentences, translate ALL of them.\n\
                 3. Do NOT summarize. Do NOT shorten. Translate LITERALLY word-for-word.\n\
                 4. Output ONLY the complete Chinese translation."
            }
        }
    }
}

impl FromStr for Direction {
    type Err = TranslateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cn-en" | "cn_en" => Ok(Direction::CnToEn),
            "en-cn" | "en_cn" => Ok(Direction::EnToCn),
            _ => Err(TranslateError::Failed(format!(
                "unknown direction: {s}. Supported directions: cn-en, en-cn"
            ))),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::CnToEn => write!(f, "cn-en"),
            Direction::EnToCn => write!(f, "en-cn"),
        }
    }
}

/// Errors surfaced by the translator client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TranslateError {
    /// Transport or upstream failure
    #[error("translation failed: {0}")]
    Failed(String),

    /// The model returned nothing usable (empty or filtered)
    #[error("translation refused")]
    Refused,

    /// The call exceeded its budget
    #[error("translation timed out")]
    Timeout,
}

impl TranslateError {
    /// Short machine-readable label, surfaced to clients in `error`
    /// messages.
    pub fn kind(&self) -> &'static str {
        match self {
            TranslateError::Failed(_) => "TranslationFailed",
            TranslateError::Refused => "TranslationRefused",
            TranslateError::Timeout => "Timeout",
        }
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

// =============================================================================
// Client
// =============================================================================

/// Stateless translation client. Cheap to clone; the underlying HTTP
/// client pools connections.
#[derive(Clone)]
pub struct Translator {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
    timeout: Duration,
}

impl Translator {
    /// Create a translator with the given credential and per-call budget.
    pub fn new(api_key: String, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            endpoint: GROQ_CHAT_URL.to_string(),
            timeout,
        }
    }

    /// Override the endpoint (used by tests against a local mock).
    pub fn with_endpoint(mut self, endpoint: String) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Translate `text` along `direction`.
    ///
    /// Returns the translated string, or `Refused` when the input or the
    /// model output is empty.
    pub async fn translate(
        &self,
        text: &str,
        direction: Direction,
    ) -> Result<String, TranslateError> {
        if text.trim().is_empty() {
            return Err(TranslateError::Refused);
        }

        let request = ChatRequest {
            model: TRANSLATE_MODEL,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: direction.system_prompt(),
                },
                ChatMessage {
                    role: "user",
                    content: text,
                },
            ],
            temperature: TRANSLATE_TEMPERATURE,
            max_tokens: TRANSLATE_MAX_TOKENS,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TranslateError::Timeout
                } else {
                    TranslateError::Failed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "translator returned error status");
            return Err(TranslateError::Failed(format!("status {status}: {body}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| TranslateError::Failed(format!("invalid response body: {e}")))?;

        let translation = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or(TranslateError::Refused)?;

        debug!(chars = translation.len(), %direction, "translation complete");
        Ok(translation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_from_str() {
        assert_eq!("cn-en".parse::<Direction>().unwrap(), Direction::CnToEn);
        assert_eq!("CN-EN".parse::<Direction>().unwrap(), Direction::CnToEn);
        assert_eq!("en-cn".parse::<Direction>().unwrap(), Direction::EnToCn);
        assert_eq!("en_cn".parse::<Direction>().unwrap(), Direction::EnToCn);
        assert!("fr-de".parse::<Direction>().is_err());
    }

    #[test]
    fn test_direction_display_round_trip() {
        for direction in [Direction::CnToEn, Direction::EnToCn] {
            let parsed: Direction = direction.to_string().parse().unwrap();
            assert_eq!(parsed, direction);
        }
    }

    #[test]
    fn test_direction_language_and_voice_pairing() {
        assert_eq!(Direction::CnToEn.stt_language(), "zh-CN");
        assert_eq!(Direction::CnToEn.tts_voice(), "en-US-GuyNeural");
        assert_eq!(Direction::EnToCn.stt_language(), "en-US");
        assert_eq!(Direction::EnToCn.tts_voice(), "zh-CN-YunxiNeural");
    }

    #[test]
    fn test_system_prompts_pin_target_language() {
        assert!(Direction::CnToEn.system_prompt().contains("English"));
        assert!(Direction::EnToCn.system_prompt().contains("Chinese"));
    }

    #[tokio::test]
    async fn test_empty_input_is_refused_without_network() {
        let translator = Translator::new("key".to_string(), Duration::from_secs(1));
        let err = translator.translate("   ", Direction::EnToCn).await.unwrap_err();
        assert!(matches!(err, TranslateError::Refused));
    }

    #[test]
    fn test_chat_request_serialization() {
        let request = ChatRequest {
            model: TRANSLATE_MODEL,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "prompt",
                },
                ChatMessage {
                    role: "user",
                    content: "hello",
                },
            ],
            temperature: TRANSLATE_TEMPERATURE,
            max_tokens: TRANSLATE_MAX_TOKENS,
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""model":"llama-3.1-8b-instant""#));
        assert!(json.contains(r#""role":"system""#));
        assert!(json.contains(r#""max_tokens":1024"#));
    }

    #[test]
    fn test_chat_response_parsing() {
        let json = r#"{
            "choices": [{"message": {"role": "assistant", "content": "你好"}}]
        }"#;
        let parsed: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("你好")
        );
    }

    #[test]
    fn test_chat_response_parsing_empty_choices() {
        let parsed: ChatResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.choices.is_empty());
    }
}
