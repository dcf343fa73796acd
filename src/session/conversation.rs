//! Per-browser push-to-talk session.
//!
//! The state machine runs as a single task selecting on client ingress,
//! STT events, and timers:
//!
//! ```text
//!           ┌────────── Idle ──────────┐
//!           │                          │
//!    first audio frame             client disconnect
//!           ▼                          ▼
//!      Recording ── stop signal ──▶ Finalizing
//!           │  (frames to STT)        │  (grace window, Finalize, drain)
//!           │                         ▼
//!           │                   Translating ──▶ Synthesizing
//!           │                                       │
//!           └────────────────── Idle ◀──────────────┘
//! ```
//!
//! Ingress and egress run as separate tasks owned by the handler, so the
//! client can disconnect (and the egress can detect a stalled reader)
//! while the machine awaits a translator or TTS call.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::core::stt::{SttError, SttOptions, SttStream, TranscriptEvent};
use crate::core::translate::{Direction, Translator};
use crate::core::tts::TtsClient;
use crate::handlers::messages::{Outbound, ServerMessage};

use super::{Utterance, UtteranceState};

/// Hard cap on recorded audio per utterance.
const MAX_UTTERANCE_AUDIO: Duration = Duration::from_secs(30);

/// How long to keep draining STT events after Finalize if the flushed
/// final never arrives.
const FINALIZE_DRAIN: Duration = Duration::from_secs(2);

/// Two upstream connection failures within this window end the session.
const UPSTREAM_FAILURE_WINDOW: Duration = Duration::from_secs(5);

/// STT model used for conversation utterances.
const CONVERSATION_STT_MODEL: &str = "nova-2";

/// Events delivered by the ingress task.
#[derive(Debug)]
pub enum Inbound {
    /// Binary frame from the client, treated as audio
    Audio(Bytes),
    /// `{"type":"stop"}` control message
    Stop,
    /// The client socket closed
    Disconnected,
}

/// What the session loop should do after an utterance.
enum Step {
    /// Return to Idle and wait for the next push
    Continue,
    /// Tear the session down
    Shutdown,
}

/// One push-to-talk session, alive from upgrade to disconnect.
pub struct ConversationSession {
    id: Uuid,
    direction: Direction,
    config: Arc<GatewayConfig>,
    translator: Translator,
    tts: TtsClient,
    outbound: mpsc::Sender<Outbound>,
    /// Endpoint override for tests; None hits the real service
    stt_endpoint: Option<String>,
    last_upstream_failure: Option<Instant>,
}

impl ConversationSession {
    pub fn new(
        direction: Direction,
        config: Arc<GatewayConfig>,
        translator: Translator,
        tts: TtsClient,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction,
            config,
            translator,
            tts,
            outbound,
            stt_endpoint: None,
            last_upstream_failure: None,
        }
    }

    /// Point the session's STT streams at a different endpoint.
    pub fn with_stt_endpoint(mut self, endpoint: String) -> Self {
        self.stt_endpoint = Some(endpoint);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Run the session until the client disconnects or a fatal error.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>) {
        info!(session = %self.id, direction = %self.direction, "conversation session started");

        let mut next_ordinal: u64 = 0;

        loop {
            // Idle: wait for the first audio frame of the next utterance.
            match inbound.recv().await {
                None | Some(Inbound::Disconnected) => break,
                Some(Inbound::Stop) => {
                    // Stop before speech: no utterance, ordinal unchanged.
                    debug!(session = %self.id, "stop with no audio");
                    if self.send_error("TranslationRefused").await.is_err() {
                        break;
                    }
                }
                Some(Inbound::Audio(frame)) => {
                    if frame.is_empty() {
                        continue;
                    }
                    let ordinal = next_ordinal;
                    next_ordinal += 1;
                    match self.run_utterance(ordinal, frame, &mut inbound).await {
                        Step::Continue => {}
                        Step::Shutdown => break,
                    }
                }
            }
        }

        let _ = self.outbound.send(Outbound::Close).await;
        info!(session = %self.id, "conversation session ended");
    }

    /// Drive one utterance from first frame to delivery (or failure).
    async fn run_utterance(
        &mut self,
        ordinal: u64,
        first_frame: Bytes,
        inbound: &mut mpsc::Receiver<Inbound>,
    ) -> Step {
        let mut utterance = Utterance::new(ordinal);

        let options = SttOptions {
            api_key: self.config.stt_api_key.clone(),
            model: CONVERSATION_STT_MODEL.to_string(),
            language: self.direction.stt_language().to_string(),
            utterance_end_ms: self.config.utterance_end_ms,
            endpointing_ms: self.config.endpointing_ms,
            endpoint: self.stt_endpoint.clone(),
            ..Default::default()
        };

        let mut stt = match SttStream::open(options).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(session = %self.id, ordinal, "failed to open STT stream: {e}");
                utterance.fail();
                return self.handle_upstream_failure(&e).await;
            }
        };
        let mut events = stt.events();

        if let Err(e) = stt.send(first_frame) {
            debug!(session = %self.id, "dropping first frame: {e}");
        }

        let audio_deadline = Instant::now() + MAX_UTTERANCE_AUDIO;

        // Recording: forward audio, surface transcripts, wait for stop.
        let stopped_at = loop {
            tokio::select! {
                maybe = inbound.recv() => match maybe {
                    None | Some(Inbound::Disconnected) => {
                        utterance.fail();
                        let _ = stt.close().await;
                        return Step::Shutdown;
                    }
                    Some(Inbound::Stop) => break Instant::now(),
                    Some(Inbound::Audio(frame)) => {
                        match stt.send(frame) {
                            Ok(()) => {}
                            Err(SttError::Backpressured) => {
                                warn!(session = %self.id, "STT backpressure, dropping frame");
                            }
                            Err(e) => {
                                warn!(session = %self.id, "STT send failed: {e}");
                            }
                        }
                    }
                },
                event = events.recv() => match event {
                    Some(event) => {
                        if let Some(step) = self.absorb_event(&mut utterance, event, &mut stt).await {
                            return step;
                        }
                    }
                    None => {
                        // Upstream closed mid-recording without a terminal error
                        utterance.fail();
                        let _ = stt.close().await;
                        if self.send_error("UpstreamUnavailable").await.is_err() {
                            return Step::Shutdown;
                        }
                        return Step::Continue;
                    }
                },
                _ = sleep_until(audio_deadline) => {
                    warn!(session = %self.id, ordinal, "utterance exceeded audio ceiling");
                    utterance.fail();
                    let _ = stt.close().await;
                    if self.send_error("Timeout").await.is_err() {
                        return Step::Shutdown;
                    }
                    return Step::Continue;
                },
            }
        };

        utterance.advance(UtteranceState::Finalizing);

        // Trailing window: the stop signal races the last audio frames, so
        // keep forwarding for a grace period before flushing upstream.
        let grace_deadline = Instant::now() + self.config.stop_grace;
        loop {
            tokio::select! {
                _ = sleep_until(grace_deadline) => break,
                maybe = inbound.recv() => match maybe {
                    None | Some(Inbound::Disconnected) => {
                        utterance.fail();
                        let _ = stt.close().await;
                        return Step::Shutdown;
                    }
                    // A second stop while already finalizing is ignored
                    Some(Inbound::Stop) => {}
                    Some(Inbound::Audio(frame)) => {
                        if let Err(e) = stt.send(frame) {
                            debug!(session = %self.id, "late frame dropped: {e}");
                        }
                    }
                },
                event = events.recv() => match event {
                    Some(event) => {
                        if let Some(step) = self.absorb_event(&mut utterance, event, &mut stt).await {
                            return step;
                        }
                    }
                    None => break,
                },
            }
        }

        if let Err(e) = stt.finalize().await {
            debug!(session = %self.id, "finalize failed: {e}");
        }

        // Drain until the flushed final arrives (or the drain budget ends).
        let drain_deadline = Instant::now() + FINALIZE_DRAIN;
        loop {
            tokio::select! {
                _ = sleep_until(drain_deadline) => break,
                maybe = inbound.recv() => match maybe {
                    None | Some(Inbound::Disconnected) => {
                        utterance.fail();
                        let _ = stt.close().await;
                        return Step::Shutdown;
                    }
                    Some(Inbound::Stop) | Some(Inbound::Audio(_)) => {}
                },
                event = events.recv() => match event {
                    Some(TranscriptEvent::Final { text, from_finalize, .. }) => {
                        utterance.push_final(&text);
                        if from_finalize {
                            break;
                        }
                    }
                    Some(TranscriptEvent::Interim { text, .. }) => {
                        utterance.set_interim(&text);
                    }
                    Some(TranscriptEvent::Error(e)) => {
                        // An idle timeout after speech already produced
                        // finals is just the end of the utterance.
                        if !(matches!(e, SttError::IdleTimeout) && utterance.has_finals()) {
                            debug!(session = %self.id, "STT error during drain: {e}");
                        }
                        break;
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }

        let _ = stt.close().await;
        utterance.advance(UtteranceState::Finalized);

        let text = utterance.final_text();
        if text.is_empty() {
            debug!(session = %self.id, ordinal, "no committed transcript");
            utterance.fail();
            if self.send_error("TranslationRefused").await.is_err() {
                return Step::Shutdown;
            }
            return Step::Continue;
        }

        info!(session = %self.id, ordinal, chars = text.len(), "transcript committed");

        // Translating and Synthesizing share the hard ceiling measured
        // from the stop signal.
        let ceiling = stopped_at + self.config.hard_ceiling;

        utterance.advance(UtteranceState::Translating);
        let translation = tokio::select! {
            result = self.translator.translate(&text, self.direction) => match result {
                Ok(translation) => translation,
                Err(e) => {
                    warn!(session = %self.id, ordinal, "translation failed: {e}");
                    utterance.fail();
                    if self.send_error(e.kind()).await.is_err() {
                        return Step::Shutdown;
                    }
                    return Step::Continue;
                }
            },
            _ = sleep_until(ceiling) => {
                warn!(session = %self.id, ordinal, "hard ceiling hit while translating");
                utterance.fail();
                if self.send_error("Timeout").await.is_err() {
                    return Step::Shutdown;
                }
                return Step::Continue;
            },
            _ = wait_for_disconnect(inbound) => {
                utterance.fail();
                return Step::Shutdown;
            },
        };

        if self
            .send_message(ServerMessage::Translation {
                original: text.clone(),
                translation: translation.clone(),
            })
            .await
            .is_err()
        {
            utterance.fail();
            return Step::Shutdown;
        }

        utterance.advance(UtteranceState::Synthesizing);
        let audio = tokio::select! {
            result = self.tts.synthesize(&translation, self.direction.tts_voice()) => match result {
                Ok(audio) => audio,
                Err(e) => {
                    warn!(session = %self.id, ordinal, "synthesis failed: {e}");
                    utterance.fail();
                    if self.send_error(e.kind()).await.is_err() {
                        return Step::Shutdown;
                    }
                    return Step::Continue;
                }
            },
            _ = sleep_until(ceiling) => {
                warn!(session = %self.id, ordinal, "hard ceiling hit while synthesizing");
                utterance.fail();
                if self.send_error("Timeout").await.is_err() {
                    return Step::Shutdown;
                }
                return Step::Continue;
            },
            // Disconnect mid-synthesis cancels the TTS call outright
            _ = wait_for_disconnect(inbound) => {
                utterance.fail();
                return Step::Shutdown;
            },
        };

        if self.send(Outbound::Audio(audio.data)).await.is_err() {
            utterance.fail();
            return Step::Shutdown;
        }

        utterance.advance(UtteranceState::Delivered);
        info!(session = %self.id, ordinal, "utterance delivered");
        Step::Continue
    }

    /// Handle a transcript event during Recording / the grace window.
    ///
    /// Returns `Some(step)` when the event ends the utterance.
    async fn absorb_event(
        &mut self,
        utterance: &mut Utterance,
        event: TranscriptEvent,
        stt: &mut SttStream,
    ) -> Option<Step> {
        match event {
            TranscriptEvent::Interim { text, .. } => {
                utterance.set_interim(&text);
                if self
                    .send_message(ServerMessage::TranscriptionUpdate {
                        text: utterance.preview_text(),
                    })
                    .await
                    .is_err()
                {
                    return Some(Step::Shutdown);
                }
                None
            }
            TranscriptEvent::Final { text, .. } => {
                utterance.push_final(&text);
                if self
                    .send_message(ServerMessage::TranscriptionUpdate {
                        text: utterance.preview_text(),
                    })
                    .await
                    .is_err()
                {
                    return Some(Step::Shutdown);
                }
                None
            }
            // Push-to-talk segmentation is the stop signal, not the gap
            TranscriptEvent::UtteranceEnd { .. } | TranscriptEvent::SpeechStarted { .. } => None,
            TranscriptEvent::Error(e) => {
                warn!(session = %self.id, "STT error: {e}");
                utterance.fail();
                let _ = stt.close().await;
                let step = self.handle_upstream_failure(&e).await;
                Some(step)
            }
        }
    }

    /// Surface an upstream failure and decide whether it ends the session.
    ///
    /// A single failure ends the utterance only; two within the failure
    /// window are session-fatal.
    async fn handle_upstream_failure(&mut self, error: &SttError) -> Step {
        if self.send_error(error.kind()).await.is_err() {
            return Step::Shutdown;
        }
        if matches!(error, SttError::UpstreamUnavailable(_)) {
            let now = Instant::now();
            let repeated = self
                .last_upstream_failure
                .is_some_and(|t| now.duration_since(t) < UPSTREAM_FAILURE_WINDOW);
            self.last_upstream_failure = Some(now);
            if repeated {
                warn!(session = %self.id, "repeated upstream failure, closing session");
                return Step::Shutdown;
            }
        }
        Step::Continue
    }

    async fn send(&self, frame: Outbound) -> Result<(), ()> {
        self.outbound.send(frame).await.map_err(|_| ())
    }

    async fn send_message(&self, message: ServerMessage) -> Result<(), ()> {
        self.send(Outbound::Message(message)).await
    }

    async fn send_error(&self, kind: &str) -> Result<(), ()> {
        self.send_message(ServerMessage::Error {
            message: kind.to_string(),
        })
        .await
    }
}

/// Discard ingress until the client goes away.
///
/// Used while a translator or TTS call is in flight: audio for a next
/// utterance cannot start before the current one completes, and a stray
/// stop has nothing left to stop.
async fn wait_for_disconnect(inbound: &mut mpsc::Receiver<Inbound>) {
    loop {
        match inbound.recv().await {
            None | Some(Inbound::Disconnected) => return,
            Some(Inbound::Audio(_)) | Some(Inbound::Stop) => continue,
        }
    }
}
