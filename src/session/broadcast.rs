//! Long-lived broadcast session.
//!
//! One continuous STT stream is fed by the publisher connection; the
//! service's segmentation events slice the transcript into utterances,
//! each of which runs the translate → synthesize pipeline and is fanned
//! out to every subscriber through the hub.
//!
//! The STT stream is re-established on fatal errors with exponential
//! backoff. Internally utterance ordinals restart with each fresh stream;
//! the session masks this by numbering segments from a session-wide
//! counter, and word timestamps are adjusted by the wall-clock start of
//! the current stream so they stay monotonic across reconnects.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::core::hub::{Hub, HubFrame};
use crate::core::stt::{SttError, SttOptions, SttStream, TranscriptEvent};
use crate::core::translate::{Direction, Translator};
use crate::core::tts::TtsClient;
use crate::handlers::messages::ServerMessage;

use super::Utterance;

/// Translate early when the buffer ends a sentence and has this many words.
const MIN_WORDS_SENTENCE: usize = 10;

/// Translate on a natural pause (`speech_final`) at this many words.
const MIN_WORDS_PAUSE: usize = 25;

/// Translate unconditionally at this many words.
const FORCE_TRANSLATE_WORDS: usize = 40;

/// Discard an `UtteranceEnd` flush below this many words.
const MIN_WORDS_UTTERANCE_END: usize = 8;

/// First reconnect delay; doubles per attempt.
const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Reconnect delay cap.
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// STT model for the continuous broadcast stream.
const BROADCAST_STT_MODEL: &str = "nova-3";

/// Decide whether a buffered finals concatenation is ready to translate
/// before the utterance-end gap fires.
fn ready_to_translate(text: &str, word_count: usize, speech_final: bool) -> bool {
    let has_ending = text
        .trim_end()
        .ends_with(['.', '!', '?']);
    (has_ending && word_count >= MIN_WORDS_SENTENCE)
        || (speech_final && word_count >= MIN_WORDS_PAUSE)
        || word_count >= FORCE_TRANSLATE_WORDS
}

/// Adjust a per-stream timestamp into the session's time base.
fn adjusted_timestamp(stream_offset_secs: f64, event_end_secs: f64) -> f64 {
    stream_offset_secs + event_end_secs
}

/// Control handle held by the gateway state while a publisher is live.
pub struct BroadcastHandle {
    audio_tx: mpsc::Sender<Bytes>,
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl BroadcastHandle {
    /// Forward one publisher audio frame. Backpressure drops the frame:
    /// live audio is worthless late.
    pub fn send_audio(&self, frame: Bytes) {
        if frame.is_empty() {
            return;
        }
        if self.audio_tx.try_send(frame).is_err() {
            debug!("broadcast audio queue full, dropping frame");
        }
    }

    /// A clone of the audio channel for the publisher handler's hot path.
    ///
    /// The session ends when every sender (this clone included) is gone,
    /// so the handler must drop it before awaiting shutdown.
    pub fn audio_sender(&self) -> mpsc::Sender<Bytes> {
        self.audio_tx.clone()
    }

    /// Authoritative stop: cancels in-flight pipeline work and clears
    /// every subscriber queue.
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// Shut the session down (publisher disconnected) and wait for it.
    pub async fn shutdown(self) {
        drop(self.audio_tx);
        drop(self.stop_tx);
        let _ = self.task.await;
    }
}

/// The broadcast session task and its collaborators.
pub struct BroadcastSession {
    config: Arc<GatewayConfig>,
    hub: Arc<Hub>,
    translator: Translator,
    tts: TtsClient,
    direction: Direction,
    /// Raw-PCM encoding negotiated by the publisher, if any
    encoding: Option<String>,
    sample_rate: Option<u32>,
    /// Endpoint override for tests; None hits the real service
    stt_endpoint: Option<String>,
    /// Session-wide segment numbering, monotonic across STT reconnects
    next_ordinal: u64,
}

impl BroadcastSession {
    pub fn new(
        config: Arc<GatewayConfig>,
        hub: Arc<Hub>,
        translator: Translator,
        tts: TtsClient,
        direction: Direction,
        encoding: Option<String>,
        sample_rate: Option<u32>,
    ) -> Self {
        Self {
            config,
            hub,
            translator,
            tts,
            direction,
            encoding,
            sample_rate,
            stt_endpoint: None,
            next_ordinal: 0,
        }
    }

    /// Point the session's STT streams at a different endpoint.
    pub fn with_stt_endpoint(mut self, endpoint: String) -> Self {
        self.stt_endpoint = Some(endpoint);
        self
    }

    /// Spawn the session task and return its control handle.
    pub fn spawn(self) -> BroadcastHandle {
        let (audio_tx, audio_rx) = mpsc::channel::<Bytes>(64);
        let (stop_tx, stop_rx) = mpsc::channel::<()>(4);
        let task = tokio::spawn(self.run(audio_rx, stop_rx));
        BroadcastHandle {
            audio_tx,
            stop_tx,
            task,
        }
    }

    fn stt_options(&self) -> SttOptions {
        SttOptions {
            api_key: self.config.stt_api_key.clone(),
            model: BROADCAST_STT_MODEL.to_string(),
            language: self.direction.stt_language().to_string(),
            utterance_end_ms: self.config.utterance_end_ms,
            endpointing_ms: self.config.endpointing_ms,
            encoding: self.encoding.clone(),
            sample_rate: self.sample_rate,
            endpoint: self.stt_endpoint.clone(),
            ..Default::default()
        }
    }

    async fn run(
        mut self,
        mut audio_rx: mpsc::Receiver<Bytes>,
        mut stop_rx: mpsc::Receiver<()>,
    ) {
        info!(direction = %self.direction, "broadcast session started");

        let session_start = Instant::now();
        let mut backoff = RECONNECT_BACKOFF_INITIAL;
        let mut inflight: Option<JoinHandle<()>> = None;

        'reconnect: loop {
            let mut stt = match SttStream::open(self.stt_options()).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("failed to open broadcast STT stream: {e}");
                    if audio_rx.is_closed() {
                        break 'reconnect;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                    continue 'reconnect;
                }
            };
            backoff = RECONNECT_BACKOFF_INITIAL;

            let stream_offset = session_start.elapsed().as_secs_f64();
            let mut events = stt.events();
            let mut buffer = Utterance::new(self.next_ordinal);

            info!(offset_secs = stream_offset, "broadcast STT stream established");

            loop {
                tokio::select! {
                    maybe_frame = audio_rx.recv() => match maybe_frame {
                        Some(frame) => match stt.send(frame) {
                            Ok(()) => {}
                            Err(SttError::Backpressured) => {
                                debug!("broadcast STT backpressure, dropping frame");
                            }
                            Err(e) => {
                                warn!("broadcast STT send failed: {e}");
                                break;
                            }
                        },
                        None => {
                            // Publisher disconnected: graceful end of session
                            let _ = stt.close().await;
                            break 'reconnect;
                        }
                    },

                    event = events.recv() => match event {
                        Some(TranscriptEvent::Final { text, speech_final, end, .. }) => {
                            buffer.push_final(&text);
                            let committed = buffer.final_text();
                            let word_count = buffer.word_count();
                            let end_at = adjusted_timestamp(stream_offset, end);
                            debug!(word_count, end_at, "broadcast final segment");

                            if !committed.is_empty()
                                && ready_to_translate(&committed, word_count, speech_final)
                            {
                                buffer.reset_transcript();
                                self.start_segment(committed, &mut inflight);
                            }
                        }
                        Some(TranscriptEvent::UtteranceEnd { last_word_end }) => {
                            let committed = buffer.final_text();
                            let word_count = buffer.word_count();
                            buffer.reset_transcript();

                            if committed.is_empty() {
                                continue;
                            }
                            if word_count < MIN_WORDS_UTTERANCE_END {
                                debug!(word_count, "skipping short utterance-end flush");
                                continue;
                            }
                            let end_at = adjusted_timestamp(stream_offset, last_word_end);
                            info!(word_count, end_at, "utterance ended");
                            self.start_segment(committed, &mut inflight);
                        }
                        // Interims are not broadcast; subscribers only see
                        // completed translations.
                        Some(TranscriptEvent::Interim { .. })
                        | Some(TranscriptEvent::SpeechStarted { .. }) => {}
                        Some(TranscriptEvent::Error(e)) => {
                            warn!("broadcast STT error: {e}");
                            break;
                        }
                        None => {
                            warn!("broadcast STT stream ended");
                            break;
                        }
                    },

                    Some(()) = stop_rx.recv() => {
                        info!("broadcast stop: cancelling in-flight work");
                        if let Some(handle) = inflight.take() {
                            handle.abort();
                        }
                        buffer.reset_transcript();
                        self.hub.clear();
                        self.hub.publish(HubFrame::Text(
                            ServerMessage::Status {
                                message: "Translation stopped".to_string(),
                            }
                            .to_json(),
                        ));
                    },
                }
            }

            // Fatal stream error: tear down and reconnect with backoff.
            let _ = stt.close().await;
            if audio_rx.is_closed() {
                break 'reconnect;
            }
            self.hub.publish(HubFrame::Text(
                ServerMessage::Status {
                    message: "Reconnecting to transcription service".to_string(),
                }
                .to_json(),
            ));
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
        }

        if let Some(handle) = inflight.take() {
            handle.abort();
        }
        info!("broadcast session ended");
    }

    /// Run one segment through translate → synthesize → fan-out.
    ///
    /// At most one segment pipeline is in flight; a newer segment
    /// abandons an unfinished predecessor.
    fn start_segment(&mut self, text: String, inflight: &mut Option<JoinHandle<()>>) {
        if let Some(previous) = inflight.take() {
            if !previous.is_finished() {
                warn!("abandoning in-flight utterance for newer segment");
                previous.abort();
            }
        }

        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;

        let hub = self.hub.clone();
        let translator = self.translator.clone();
        let tts = self.tts.clone();
        let direction = self.direction;

        *inflight = Some(tokio::spawn(async move {
            info!(ordinal, chars = text.len(), "segment pipeline started");

            let translation = match translator.translate(&text, direction).await {
                Ok(translation) => translation,
                Err(e) => {
                    warn!(ordinal, "broadcast translation failed: {e}");
                    return;
                }
            };

            hub.publish(HubFrame::Text(
                ServerMessage::Translation {
                    original: text,
                    translation: translation.clone(),
                }
                .to_json(),
            ));

            match tts.synthesize(&translation, direction.tts_voice()).await {
                Ok(audio) => {
                    hub.publish(HubFrame::Audio(audio.data));
                    info!(ordinal, "segment broadcast complete");
                }
                Err(e) => {
                    warn!(ordinal, "broadcast synthesis failed: {e}");
                    hub.publish(HubFrame::Text(
                        ServerMessage::Status {
                            message: format!("Synthesis unavailable: {}", e.kind()),
                        }
                        .to_json(),
                    ));
                }
            }
        }));
    }
}
