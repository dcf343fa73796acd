//! Deepgram streaming STT websocket client.
//!
//! # Architecture
//!
//! One connection task owns the websocket and multiplexes three inputs:
//!
//! ```text
//! ┌──────────────┐     ┌───────────────────┐     ┌──────────────────┐
//! │    send()    │────▶│  audio_tx (mpsc)  │────▶│                  │
//! └──────────────┘     └───────────────────┘     │                  │
//! ┌──────────────┐     ┌───────────────────┐     │  Connection Task │
//! │ finalize()/  │────▶│ control_tx (mpsc) │────▶│                  │
//! │   close()    │     └───────────────────┘     └────────┬─────────┘
//! └──────────────┘     ┌───────────────────┐              │
//!                      │  events_tx (mpsc) │◀─────────────┘
//!                      └────────┬──────────┘
//!                               ▼
//!                        events() receiver
//! ```
//!
//! Audio is forwarded upstream as binary frames; `KeepAlive` is injected
//! after 3 s without an outbound frame so the service does not terminate
//! the socket during push-to-talk pauses. The event receiver yields a
//! lazy, finite sequence that ends when the socket is torn down.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::config::{SttOptions, DEEPGRAM_HOST};
use super::messages::{
    map_close_frame, CloseStreamMessage, DeepgramMessage, FinalizeMessage, KeepAliveMessage,
};
use super::{SttError, TranscriptEvent};

/// Depth of the outbound audio queue; `send` reports `Backpressured`
/// beyond this high-water mark.
const AUDIO_QUEUE_DEPTH: usize = 32;

/// Depth of the event queue toward the session.
const EVENT_QUEUE_DEPTH: usize = 256;

/// Send a keepalive after this long without an outbound audio frame.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);

/// Budget for the initial websocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for the CloseStream / Metadata shutdown handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

enum Control {
    Finalize,
    Close,
}

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handle to one streaming recognition socket.
///
/// Dropping the handle tears the connection down; [`SttStream::close`]
/// does the same but waits for the service's final metadata event.
#[derive(Debug)]
pub struct SttStream {
    audio_tx: mpsc::Sender<Bytes>,
    control_tx: mpsc::Sender<Control>,
    events_rx: Option<mpsc::Receiver<TranscriptEvent>>,
    task: Option<tokio::task::JoinHandle<()>>,
    closed: bool,
}

impl SttStream {
    /// Open a streaming recognition socket with the given options.
    ///
    /// Fails with [`SttError::Config`] before any network activity when
    /// the options are invalid, and with [`SttError::UpstreamUnavailable`]
    /// when the service cannot be reached.
    pub async fn open(options: SttOptions) -> Result<Self, SttError> {
        options.validate()?;

        let ws_url = options.build_websocket_url();
        let request = tokio_tungstenite::tungstenite::http::Request::builder()
            .method("GET")
            .uri(&ws_url)
            .header("Host", DEEPGRAM_HOST)
            .header("Upgrade", "websocket")
            .header("Connection", "upgrade")
            .header("Sec-WebSocket-Key", generate_key())
            .header("Sec-WebSocket-Version", "13")
            .header("Authorization", format!("Token {}", options.api_key))
            .body(())
            .map_err(|e| SttError::Config(format!("failed to build upgrade request: {e}")))?;

        let (ws_stream, _response) = timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| SttError::UpstreamUnavailable("connect timeout".to_string()))?
            .map_err(|e| SttError::UpstreamUnavailable(e.to_string()))?;

        info!(model = %options.model, language = %options.language, "connected to STT stream");

        let (audio_tx, audio_rx) = mpsc::channel::<Bytes>(AUDIO_QUEUE_DEPTH);
        let (control_tx, control_rx) = mpsc::channel::<Control>(8);
        let (events_tx, events_rx) = mpsc::channel::<TranscriptEvent>(EVENT_QUEUE_DEPTH);

        let task = tokio::spawn(run_connection(ws_stream, audio_rx, control_rx, events_tx));

        Ok(Self {
            audio_tx,
            control_tx,
            events_rx: Some(events_rx),
            task: Some(task),
            closed: false,
        })
    }

    /// Enqueue an audio frame for upstream delivery without blocking.
    ///
    /// Zero-length frames are dropped silently: the service would treat
    /// them as an end-of-stream marker.
    pub fn send(&self, frame: Bytes) -> Result<(), SttError> {
        if frame.is_empty() {
            return Ok(());
        }
        if self.closed {
            return Err(SttError::Closed);
        }
        match self.audio_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SttError::Backpressured),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SttError::Closed),
        }
    }

    /// Ask the service to flush everything it has buffered.
    ///
    /// The flushed transcript arrives on the event stream as a `Final`
    /// with `from_finalize` set.
    pub async fn finalize(&self) -> Result<(), SttError> {
        if self.closed {
            return Err(SttError::Closed);
        }
        self.control_tx
            .send(Control::Finalize)
            .await
            .map_err(|_| SttError::Closed)
    }

    /// Gracefully shut the stream down.
    ///
    /// Sends `CloseStream`, waits for the service's final metadata event
    /// (bounded by an internal timeout), then tears the socket down.
    /// Calling `close` on an already-closed stream is a no-op.
    pub async fn close(&mut self) -> Result<(), SttError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let _ = self.control_tx.send(Control::Close).await;
        if let Some(task) = self.task.take() {
            if timeout(CLOSE_TIMEOUT, task).await.is_err() {
                warn!("STT connection task did not finish within close timeout");
            }
        }
        Ok(())
    }

    /// Take the event receiver. The sequence is lazy, finite, and not
    /// restartable; this may only be called once per stream.
    pub fn events(&mut self) -> mpsc::Receiver<TranscriptEvent> {
        self.events_rx
            .take()
            .expect("SttStream::events may only be taken once")
    }
}

impl Drop for SttStream {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.control_tx.try_send(Control::Close);
        }
        // The detached connection task finishes the shutdown handshake on
        // its own; it is bounded by CLOSE_TIMEOUT either way.
    }
}

/// The connection task: multiplexes audio egress, control messages, and
/// upstream events until the socket closes.
async fn run_connection(
    ws_stream: UpstreamSocket,
    mut audio_rx: mpsc::Receiver<Bytes>,
    mut control_rx: mpsc::Receiver<Control>,
    events_tx: mpsc::Sender<TranscriptEvent>,
) {
    let (mut ws_sink, mut ws_source) = ws_stream.split();

    let mut keepalive = interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; consume it so
    // the first keepalive goes out 3 s after connect, not at connect.
    keepalive.tick().await;

    // Once draining, only the drain deadline and the upstream source are
    // polled until the service's final metadata event arrives.
    let mut draining = false;
    let mut drain_deadline = tokio::time::Instant::now();

    loop {
        tokio::select! {
            maybe_frame = audio_rx.recv(), if !draining => {
                match maybe_frame {
                    Some(frame) => {
                        let frame_len = frame.len();
                        if let Err(e) = ws_sink.send(Message::Binary(frame)).await {
                            warn!("failed to send audio upstream: {e}");
                            let _ = events_tx
                                .send(TranscriptEvent::Error(SttError::UpstreamUnavailable(e.to_string())))
                                .await;
                            break;
                        }
                        debug!("sent {frame_len} bytes of audio upstream");
                        keepalive.reset();
                    }
                    None => {
                        // Owner dropped the handle without close(); run the
                        // shutdown handshake anyway.
                        let json = serde_json::to_string(&CloseStreamMessage::default())
                            .expect("static control message serializes");
                        let _ = ws_sink.send(Message::Text(json.into())).await;
                        draining = true;
                        drain_deadline = tokio::time::Instant::now() + CLOSE_TIMEOUT;
                    }
                }
            }

            Some(control) = control_rx.recv(), if !draining => {
                match control {
                    Control::Finalize => {
                        let json = serde_json::to_string(&FinalizeMessage::default())
                            .expect("static control message serializes");
                        if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                            warn!("failed to send Finalize: {e}");
                        }
                        keepalive.reset();
                    }
                    Control::Close => {
                        let json = serde_json::to_string(&CloseStreamMessage::default())
                            .expect("static control message serializes");
                        if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                            debug!("failed to send CloseStream: {e}");
                            break;
                        }
                        draining = true;
                        drain_deadline = tokio::time::Instant::now() + CLOSE_TIMEOUT;
                    }
                }
            }

            message = ws_source.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_text_frame(&text, &events_tx, draining).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match &frame {
                            Some(f) => (u16::from(f.code), f.reason.to_string()),
                            None => (1000, String::new()),
                        };
                        info!(code, %reason, "STT socket closed by service");
                        if !draining {
                            if let Some(error) = map_close_frame(code, &reason) {
                                let _ = events_tx.send(TranscriptEvent::Error(error)).await;
                            }
                        }
                        break;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        debug!("websocket ping/pong from service");
                    }
                    Some(Ok(_)) => {
                        debug!("unexpected frame type from STT service");
                    }
                    Some(Err(e)) => {
                        warn!("STT websocket error: {e}");
                        if !draining {
                            let _ = events_tx
                                .send(TranscriptEvent::Error(SttError::UpstreamUnavailable(e.to_string())))
                                .await;
                        }
                        break;
                    }
                    None => {
                        info!("STT websocket stream ended");
                        break;
                    }
                }
            }

            _ = keepalive.tick(), if !draining => {
                let json = serde_json::to_string(&KeepAliveMessage::default())
                    .expect("static control message serializes");
                if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                    warn!("failed to send KeepAlive: {e}");
                    let _ = events_tx
                        .send(TranscriptEvent::Error(SttError::UpstreamUnavailable(e.to_string())))
                        .await;
                    break;
                }
                debug!("sent KeepAlive");
            }

            _ = tokio::time::sleep_until(drain_deadline), if draining => {
                warn!("timed out waiting for final metadata after CloseStream");
                break;
            }
        }
    }

    let _ = ws_sink.send(Message::Close(None)).await;
    info!("STT connection task finished");
    // events_tx drops here; the receiver observes the end of the sequence.
}

/// Parse one upstream text frame and forward the resulting event.
///
/// Returns false when the frame ends the stream (final metadata after a
/// CloseStream handshake).
async fn handle_text_frame(
    text: &str,
    events_tx: &mpsc::Sender<TranscriptEvent>,
    draining: bool,
) -> bool {
    match DeepgramMessage::parse(text) {
        Ok(DeepgramMessage::Results(results)) => {
            let transcript = results.transcript().unwrap_or_default().to_string();
            let event = if results.is_final {
                Some(TranscriptEvent::Final {
                    text: transcript,
                    channel: results.channel(),
                    end: results.end(),
                    speech_final: results.speech_final,
                    from_finalize: results.from_finalize,
                })
            } else if !transcript.is_empty() {
                Some(TranscriptEvent::Interim {
                    text: transcript,
                    channel: results.channel(),
                    end: results.end(),
                })
            } else {
                // Empty interims carry no information
                None
            };
            if let Some(event) = event {
                if events_tx.send(event).await.is_err() {
                    debug!("event receiver dropped, stopping STT forwarding");
                    return false;
                }
            }
            true
        }
        Ok(DeepgramMessage::UtteranceEnd(event)) => {
            let _ = events_tx
                .send(TranscriptEvent::UtteranceEnd {
                    last_word_end: event.last_word_end,
                })
                .await;
            true
        }
        Ok(DeepgramMessage::SpeechStarted(event)) => {
            let _ = events_tx
                .send(TranscriptEvent::SpeechStarted {
                    timestamp: event.timestamp,
                })
                .await;
            true
        }
        Ok(DeepgramMessage::Metadata(meta)) => {
            debug!(request_id = %meta.request_id, "stream metadata");
            // The summary metadata is the last event of a graceful close.
            !draining
        }
        Ok(DeepgramMessage::Unknown(raw)) => {
            debug!("unknown STT message type: {raw}");
            true
        }
        Err(e) => {
            warn!("failed to parse STT message: {e}");
            true
        }
    }
}
