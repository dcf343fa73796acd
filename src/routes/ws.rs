//! Websocket route configuration.
//!
//! # Endpoints
//!
//! - `GET /ws/browser`: broadcast subscriber. Receives
//!   `{"type":"translation",...}`, `{"type":"status",...}` text events and
//!   binary MP3 audio; may send `ping`, `volume`, and the authoritative
//!   `stop`.
//! - `GET /ws/publisher`: broadcast publisher (host bridge or phone).
//!   Sends raw audio binary frames; `?encoding=linear16&sample_rate=16000`
//!   negotiates raw PCM, otherwise the audio is treated as a
//!   self-describing container.
//! - `GET /ws/conversation?mode=cn-en|en-cn`: push-to-talk session.
//!   Sends binary audio and `{"type":"stop"}`; receives
//!   `transcription_update`, `translation`, `error` text events and binary
//!   MP3 audio.

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::{browser_handler, conversation_handler, publisher_handler};
use crate::state::AppState;

/// Create the websocket router.
pub fn create_ws_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ws/browser", get(browser_handler))
        .route("/ws/publisher", get(publisher_handler))
        .route("/ws/conversation", get(conversation_handler))
        .layer(TraceLayer::new_for_http())
}
