//! Conversation-mode websocket handler.
//!
//! Upgrades `/ws/conversation?mode=<direction>`, wires the three session
//! tasks together (client ingress, client egress, state machine), and
//! releases the connection slot on teardown. The egress task enforces the
//! slow-client policy: a write stalled past the timeout aborts the session
//! with `ClientSlow`.

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
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::core::translate::Direction;
use crate::handlers::messages::{ClientMessage, Outbound, ServerMessage};
use crate::session::conversation::{ConversationSession, Inbound};
use crate::state::AppState;

/// A write blocked longer than this means the client stopped reading.
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Best-effort budget for the final error frame before a forced close.
const CLOSE_NOTICE_TIMEOUT: Duration = Duration::from_millis(100);

/// Channel depth between the tasks of one session.
const SESSION_CHANNEL_DEPTH: usize = 256;

#[derive(Debug, Deserialize)]
pub struct ConversationParams {
    mode: Option<String>,
}

/// Conversation websocket handler.
pub async fn conversation_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConversationParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let mode = params.mode.as_deref().unwrap_or("cn-en");
    let direction: Direction = match mode.parse() {
        Ok(direction) => direction,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    if state.try_acquire_conversation().is_err() {
        warn!("rejecting conversation: session cap reached");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "Server at capacity. Please try again later.",
        )
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_conversation_socket(socket, state, direction))
}

async fn handle_conversation_socket(socket: WebSocket, state: Arc<AppState>, direction: Direction) {
    info!(%direction, "conversation connection established");

    let (ws_sink, ws_source) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(SESSION_CHANNEL_DEPTH);
    let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(SESSION_CHANNEL_DEPTH);

    let egress = tokio::spawn(run_egress(ws_sink, outbound_rx));
    let ingress = tokio::spawn(run_ingress(ws_source, inbound_tx, outbound_tx.clone()));

    let mut session = ConversationSession::new(
        direction,
        state.config.clone(),
        state.translator.clone(),
        state.tts.clone(),
        outbound_tx,
    );
    if let Some(endpoint) = state.stt_endpoint() {
        session = session.with_stt_endpoint(endpoint.to_string());
    }

    session.run(inbound_rx).await;

    // The session is done; the egress drains its Close frame on its own,
    // the ingress ends with the socket.
    ingress.abort();
    let _ = egress.await;

    state.release_conversation();
    info!("conversation connection terminated");
}

/// Read client frames and translate them into session inputs.
async fn run_ingress(
    mut ws_source: SplitStream<WebSocket>,
    inbound_tx: mpsc::Sender<Inbound>,
    outbound_tx: mpsc::Sender<Outbound>,
) {
    while let Some(result) = ws_source.next().await {
        match result {
            Ok(Message::Binary(data)) => {
                if inbound_tx.send(Inbound::Audio(data)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Text(text)) => match ClientMessage::parse(&text) {
                Ok(ClientMessage::Stop) => {
                    if inbound_tx.send(Inbound::Stop).await.is_err() {
                        break;
                    }
                }
                Ok(ClientMessage::Ping) => {
                    let _ = outbound_tx.send(Outbound::Message(ServerMessage::Pong)).await;
                }
                Ok(ClientMessage::Volume { .. }) => {
                    debug!("volume control has no effect in conversation mode");
                }
                Err(e) => {
                    debug!("ignoring unparseable client message: {e}");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("conversation socket error: {e}");
                break;
            }
        }
    }
    let _ = inbound_tx.send(Inbound::Disconnected).await;
}

/// Write session outputs to the client, enforcing the slow-client policy.
async fn run_egress(mut ws_sink: SplitSink<WebSocket, Message>, mut outbound_rx: mpsc::Receiver<Outbound>) {
    while let Some(frame) = outbound_rx.recv().await {
        let write = match frame {
            Outbound::Message(message) => {
                ws_sink.send(Message::Text(message.to_json().into()))
            }
            Outbound::Audio(data) => ws_sink.send(Message::Binary(data)),
            Outbound::Close => {
                let _ = ws_sink.send(Message::Close(None)).await;
                break;
            }
        };

        match timeout(CLIENT_WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("client write failed: {e}");
                break;
            }
            Err(_) => {
                // The client stopped draining; give it one short chance to
                // hear why, then cut it off.
                warn!("client write stalled, aborting session with ClientSlow");
                let notice = ServerMessage::Error {
                    message: "ClientSlow".to_string(),
                };
                let _ = timeout(
                    CLOSE_NOTICE_TIMEOUT,
                    ws_sink.send(Message::Text(notice.to_json().into())),
                )
                .await;
                let _ = timeout(CLOSE_NOTICE_TIMEOUT, ws_sink.send(Message::Close(None))).await;
                break;
            }
        }
    }
    // Dropping the receiver makes every pending session send fail, which
    // the state machine treats as a fatal teardown signal.
}
