pub mod config;
pub mod core;
pub mod handlers;
pub mod routes;
pub mod session;
pub mod state;

// Re-export commonly used items for convenience
pub use crate::config::GatewayConfig;
pub use crate::core::hub::{Hub, HubFrame, OverflowPolicy, Subscriber};
pub use crate::core::stt::{SttError, SttOptions, SttStream, TranscriptEvent};
pub use crate::core::translate::{Direction, TranslateError, Translator};
pub use crate::core::tts::{TtsClient, TtsError};
pub use crate::state::AppState;
