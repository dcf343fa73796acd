//! Broadcast-mode websocket handlers.
//!
//! `/ws/browser` admits subscribers: each gets a hub subscription, a
//! drain loop, and protocol-level ping/pong liveness (two missed pongs
//! close the connection). `/ws/publisher` admits the single audio
//! publisher and owns the broadcast session's lifetime; a publisher that
//! negotiated containerized audio (no `encoding` parameter) is treated as
//! a mobile client and is additionally subscribed so it receives the
//! translations it produces.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::core::hub::{HubFrame, Subscriber};
use crate::handlers::messages::{ClientMessage, ServerMessage};
use crate::state::AppState;

/// Liveness probe interval for subscribers.
const SUBSCRIBER_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Unanswered probes before a subscriber is considered gone.
const MAX_MISSED_PONGS: u32 = 2;

// =============================================================================
// Subscriber endpoint
// =============================================================================

/// Broadcast subscriber websocket handler.
pub async fn browser_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    if state.try_acquire_subscriber().is_err() {
        warn!("rejecting subscriber: cap reached");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "Server at capacity. Please try again later.",
        )
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_browser_socket(socket, state))
}

async fn handle_browser_socket(socket: WebSocket, state: Arc<AppState>) {
    let subscriber = state.hub.subscribe();
    let subscriber_id = subscriber.id();
    info!(%subscriber_id, total = state.hub.subscriber_count(), "subscriber connected");

    let (mut ws_sink, mut ws_source) = socket.split();

    let mut ping_timer = interval(SUBSCRIBER_PING_INTERVAL);
    // Skip the immediate first tick
    ping_timer.tick().await;
    let mut missed_pongs: u32 = 0;

    loop {
        tokio::select! {
            frame = subscriber.next() => match frame {
                Some(HubFrame::Text(json)) => {
                    if ws_sink.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Some(HubFrame::Audio(data)) => {
                    if ws_sink.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                // The hub disconnected us (overflow policy or shutdown)
                None => break,
            },

            message = ws_source.next() => match message {
                Some(Ok(Message::Text(text))) => match ClientMessage::parse(&text) {
                    Ok(ClientMessage::Ping) => {
                        let pong = ServerMessage::Pong.to_json();
                        if ws_sink.send(Message::Text(pong.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(ClientMessage::Stop) => {
                        info!(%subscriber_id, "subscriber issued broadcast stop");
                        state.broadcast_stop().await;
                    }
                    Ok(ClientMessage::Volume { value }) => {
                        // Relayed to every subscriber so one control
                        // governs playback everywhere
                        debug!(value, "relaying volume update");
                        state
                            .hub
                            .publish(HubFrame::Text(ServerMessage::Volume { value }.to_json()));
                    }
                    Err(e) => {
                        debug!("ignoring unparseable subscriber message: {e}");
                    }
                },
                Some(Ok(Message::Pong(_))) => {
                    missed_pongs = 0;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("subscriber socket error: {e}");
                    break;
                }
            },

            _ = ping_timer.tick() => {
                if missed_pongs >= MAX_MISSED_PONGS {
                    warn!(%subscriber_id, "subscriber missed {MAX_MISSED_PONGS} pongs, closing");
                    break;
                }
                if ws_sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                missed_pongs += 1;
            },
        }
    }

    state.hub.unsubscribe(subscriber_id);
    state.release_subscriber();
    info!(%subscriber_id, total = state.hub.subscriber_count(), "subscriber disconnected");
}

// =============================================================================
// Publisher endpoint
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct PublisherParams {
    /// Raw audio encoding hint (e.g. "linear16"); absent for
    /// containerized (WebM/Opus) publishers
    encoding: Option<String>,
    sample_rate: Option<u32>,
}

/// Broadcast publisher websocket handler.
pub async fn publisher_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<PublisherParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_publisher_socket(socket, state, params))
}

async fn handle_publisher_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    params: PublisherParams,
) {
    let is_mobile = params.encoding.is_none();

    let audio_tx = match state
        .start_broadcast(params.encoding.clone(), params.sample_rate)
        .await
    {
        Ok(audio_tx) => audio_tx,
        Err(_) => {
            warn!("rejecting publisher: slot occupied");
            let mut socket = socket;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    info!(is_mobile, encoding = ?params.encoding, "publisher connected");
    state.hub.publish(HubFrame::Text(
        ServerMessage::Status {
            message: "Audio source connected".to_string(),
        }
        .to_json(),
    ));

    // Mobile publishers also hear the translations they produce.
    let subscriber = if is_mobile {
        Some(state.hub.subscribe())
    } else {
        None
    };

    match subscriber {
        Some(subscriber) => {
            run_mobile_publisher(socket, &audio_tx, &subscriber).await;
            state.hub.unsubscribe(subscriber.id());
        }
        None => run_bridge_publisher(socket, &audio_tx).await,
    }

    // Close the audio channel before tearing the session down; the
    // session ends once every sender is gone.
    drop(audio_tx);
    state.stop_broadcast().await;

    state.hub.publish(HubFrame::Text(
        ServerMessage::Status {
            message: "Audio source disconnected".to_string(),
        }
        .to_json(),
    ));
    info!("publisher disconnected");
}

/// Input-only publisher (the host audio bridge): binary frames in,
/// nothing out.
async fn run_bridge_publisher(
    mut socket: WebSocket,
    audio_tx: &tokio::sync::mpsc::Sender<Bytes>,
) {
    while let Some(result) = socket.recv().await {
        match result {
            Ok(Message::Binary(frame)) => {
                if !frame.is_empty() && audio_tx.try_send(frame).is_err() {
                    debug!("publisher audio queue full, dropping frame");
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("publisher socket error: {e}");
                break;
            }
        }
    }
}

/// Bidirectional publisher (a phone): audio frames in, hub frames out.
async fn run_mobile_publisher(
    socket: WebSocket,
    audio_tx: &tokio::sync::mpsc::Sender<Bytes>,
    subscriber: &Subscriber,
) {
    let (mut ws_sink, mut ws_source) = socket.split();

    loop {
        tokio::select! {
            frame = subscriber.next() => match frame {
                Some(HubFrame::Text(json)) => {
                    if ws_sink.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Some(HubFrame::Audio(data)) => {
                    if ws_sink.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },

            message = ws_source.next() => match message {
                Some(Ok(Message::Binary(frame))) => {
                    if !frame.is_empty() && audio_tx.try_send(frame).is_err() {
                        debug!("publisher audio queue full, dropping frame");
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    debug!("ignoring text message from publisher: {text}");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("publisher socket error: {e}");
                    break;
                }
            },
        }
    }
}
