//! Shared application state.
//!
//! Created once at startup and handed to every handler behind an `Arc`.
//! Owns the fan-out hub singleton, the broadcast session slot, and the
//! connection-slot counters that enforce the global caps.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::GatewayConfig;
use crate::core::hub::Hub;
use crate::core::translate::{Direction, Translator};
use crate::core::tts::TtsClient;
use crate::session::broadcast::{BroadcastHandle, BroadcastSession};

/// Why a connection could not be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    /// The conversation-session cap is reached
    SessionsExhausted,
    /// The broadcast-subscriber cap is reached
    SubscribersExhausted,
    /// The single publisher slot is occupied
    PublisherBusy,
}

pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub hub: Arc<Hub>,
    pub translator: Translator,
    pub tts: TtsClient,
    /// STT endpoint override propagated into sessions (tests only)
    stt_endpoint: Option<String>,
    broadcast: Mutex<Option<BroadcastHandle>>,
    conversation_count: AtomicUsize,
    subscriber_count: AtomicUsize,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Self {
        let config = Arc::new(config);
        let hub = Arc::new(Hub::new(config.subscriber_queue, config.overflow_policy));
        let translator = Translator::new(config.llm_api_key.clone(), config.translate_timeout);
        let tts = TtsClient::new(config.tts_timeout);

        Self {
            config,
            hub,
            translator,
            tts,
            stt_endpoint: None,
            broadcast: Mutex::new(None),
            conversation_count: AtomicUsize::new(0),
            subscriber_count: AtomicUsize::new(0),
        }
    }

    /// Point every session's STT streams at a different endpoint.
    pub fn with_stt_endpoint(mut self, endpoint: String) -> Self {
        self.stt_endpoint = Some(endpoint);
        self
    }

    pub fn stt_endpoint(&self) -> Option<&str> {
        self.stt_endpoint.as_deref()
    }

    // =========================================================================
    // Connection slots
    // =========================================================================

    /// Claim a conversation-session slot.
    pub fn try_acquire_conversation(&self) -> Result<(), SlotError> {
        let max = self.config.max_sessions;
        self.conversation_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < max).then_some(count + 1)
            })
            .map(|_| ())
            .map_err(|_| SlotError::SessionsExhausted)
    }

    /// Release a conversation-session slot. Must pair with a successful
    /// acquire.
    pub fn release_conversation(&self) {
        self.conversation_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn conversation_count(&self) -> usize {
        self.conversation_count.load(Ordering::Acquire)
    }

    /// Claim a broadcast-subscriber slot.
    pub fn try_acquire_subscriber(&self) -> Result<(), SlotError> {
        let max = self.config.max_subscribers;
        self.subscriber_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < max).then_some(count + 1)
            })
            .map(|_| ())
            .map_err(|_| SlotError::SubscribersExhausted)
    }

    /// Release a broadcast-subscriber slot. Must pair with a successful
    /// acquire.
    pub fn release_subscriber(&self) {
        self.subscriber_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::Acquire)
    }

    // =========================================================================
    // Broadcast session slot
    // =========================================================================

    /// Start the broadcast session for a newly connected publisher and
    /// return the audio channel its frames go into.
    ///
    /// Only one publisher may be live at a time.
    pub async fn start_broadcast(
        &self,
        encoding: Option<String>,
        sample_rate: Option<u32>,
    ) -> Result<tokio::sync::mpsc::Sender<Bytes>, SlotError> {
        let mut slot = self.broadcast.lock().await;
        if slot.is_some() {
            return Err(SlotError::PublisherBusy);
        }

        let mut session = BroadcastSession::new(
            self.config.clone(),
            self.hub.clone(),
            self.translator.clone(),
            self.tts.clone(),
            Direction::EnToCn,
            encoding,
            sample_rate,
        );
        if let Some(endpoint) = &self.stt_endpoint {
            session = session.with_stt_endpoint(endpoint.clone());
        }

        let handle = session.spawn();
        let audio_tx = handle.audio_sender();
        *slot = Some(handle);
        info!("broadcast session installed");
        Ok(audio_tx)
    }

    /// Authoritative stop from a subscriber: cancel in-flight pipeline
    /// work and clear every subscriber queue. No-op without a publisher.
    pub async fn broadcast_stop(&self) {
        if let Some(handle) = self.broadcast.lock().await.as_ref() {
            handle.stop();
        }
    }

    /// Tear the broadcast session down (publisher disconnected).
    pub async fn stop_broadcast(&self) {
        let handle = self.broadcast.lock().await.take();
        if let Some(handle) = handle {
            handle.shutdown().await;
            info!("broadcast session removed");
        }
    }
}
