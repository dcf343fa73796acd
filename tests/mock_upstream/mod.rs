//! In-process mocks of the three upstream services.
//!
//! The STT mock speaks just enough of the listen protocol to drive the
//! client end to end: binary audio frames produce interim + final
//! `Results`, `Finalize` is answered with a flushed final, `CloseStream`
//! with `Metadata` and a normal close. A failure behavior reproduces the
//! service's non-normal close frames. Smaller mocks stand in for the
//! chat-completion and synthesis services.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// How the mock treats a session.
#[derive(Debug, Clone, Copy)]
pub enum MockBehavior {
    /// Interim + final per audio frame, honoring Finalize / CloseStream
    Transcribe,
    /// Close with the given code/reason after the first audio frame
    FailAfterFirstAudio { code: u16, reason: &'static str },
    /// Accept audio silently; UtteranceEnd after `after_frames` frames
    UtteranceEndAfter { after_frames: u32 },
}

/// Counters observable from tests.
#[derive(Debug, Default)]
pub struct MockStats {
    pub keepalives: AtomicU32,
    pub audio_frames: AtomicU32,
    pub finalizes: AtomicU32,
}

/// Spawn the mock server on an ephemeral port. Returns the websocket URL
/// (without query string) and the shared stats.
pub async fn spawn_mock_stt(behavior: MockBehavior) -> (String, Arc<MockStats>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
    let port = listener.local_addr().expect("local addr").port();
    let stats = Arc::new(MockStats::default());

    let accept_stats = stats.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let stats = accept_stats.clone();
            tokio::spawn(async move {
                let _ = handle_connection(stream, behavior, stats).await;
            });
        }
    });

    (format!("ws://127.0.0.1:{port}/v1/listen"), stats)
}

async fn handle_connection(
    stream: TcpStream,
    behavior: MockBehavior,
    stats: Arc<MockStats>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    let mut audio_count: u32 = 0;

    while let Some(message) = read.next().await {
        match message? {
            Message::Binary(_) => {
                audio_count += 1;
                stats.audio_frames.fetch_add(1, Ordering::Relaxed);

                match behavior {
                    MockBehavior::FailAfterFirstAudio { code, reason } => {
                        let _ = write
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                    MockBehavior::Transcribe => {
                        let interim = results_json(
                            &format!("chunk {audio_count}"),
                            false,
                            false,
                            false,
                            audio_count,
                        );
                        write.send(Message::Text(interim.into())).await?;

                        let final_result = results_json(
                            &format!("chunk {audio_count} committed."),
                            true,
                            audio_count % 3 == 0,
                            false,
                            audio_count,
                        );
                        write.send(Message::Text(final_result.into())).await?;
                    }
                    MockBehavior::UtteranceEndAfter { after_frames } => {
                        if audio_count == after_frames {
                            let final_result = results_json(
                                "segment before the gap.",
                                true,
                                true,
                                false,
                                audio_count,
                            );
                            write.send(Message::Text(final_result.into())).await?;
                            let utterance_end = json!({
                                "type": "UtteranceEnd",
                                "channel": [0, 1],
                                "last_word_end": audio_count as f64 * 0.5,
                            })
                            .to_string();
                            write.send(Message::Text(utterance_end.into())).await?;
                        }
                    }
                }
            }

            Message::Text(text) => {
                if text.contains("KeepAlive") {
                    stats.keepalives.fetch_add(1, Ordering::Relaxed);
                } else if text.contains("Finalize") {
                    stats.finalizes.fetch_add(1, Ordering::Relaxed);
                    let flushed = results_json("flushed tail", true, true, true, audio_count);
                    write.send(Message::Text(flushed.into())).await?;
                } else if text.contains("CloseStream") {
                    let metadata = json!({
                        "type": "Metadata",
                        "request_id": "mock-request",
                        "duration": audio_count as f64 * 0.5,
                        "channels": 1,
                    })
                    .to_string();
                    write.send(Message::Text(metadata.into())).await?;
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            }

            Message::Close(_) => break,
            Message::Ping(payload) => {
                write.send(Message::Pong(payload)).await?;
            }
            _ => {}
        }
    }

    Ok(())
}

/// Spawn a mock chat-completion endpoint that answers every request with
/// `reply` after `delay`. Returns the endpoint URL.
pub async fn spawn_mock_translator(reply: &'static str, delay: std::time::Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
    let addr = listener.local_addr().expect("local addr");

    let app = axum::Router::new().route(
        "/",
        axum::routing::post(move || async move {
            tokio::time::sleep(delay).await;
            axum::Json(json!({
                "choices": [{"message": {"role": "assistant", "content": reply}}]
            }))
        }),
    );

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    format!("http://{addr}/")
}

/// Spawn a mock synthesis websocket that answers every SSML frame with
/// one audio frame carrying `payload` and a `turn.end`. Returns the
/// endpoint URL (the client appends its query string).
pub async fn spawn_mock_tts(payload: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let _ = handle_tts_connection(stream, payload).await;
            });
        }
    });

    format!("ws://{addr}/tts")
}

async fn handle_tts_connection(
    stream: TcpStream,
    payload: &'static [u8],
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    while let Some(message) = read.next().await {
        match message? {
            Message::Text(text) => {
                if text.contains("Path:ssml") {
                    let header = b"X-RequestId:mock\r\nContent-Type:audio/mpeg\r\nPath:audio\r\n";
                    let mut frame = Vec::with_capacity(2 + header.len() + payload.len());
                    frame.extend_from_slice(&(header.len() as u16).to_be_bytes());
                    frame.extend_from_slice(header);
                    frame.extend_from_slice(payload);
                    write.send(Message::Binary(frame.into())).await?;

                    let end = "X-RequestId:mock\r\nPath:turn.end\r\n\r\n{}";
                    write.send(Message::Text(end.into())).await?;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    Ok(())
}

fn results_json(
    transcript: &str,
    is_final: bool,
    speech_final: bool,
    from_finalize: bool,
    frame: u32,
) -> String {
    json!({
        "type": "Results",
        "channel_index": [0, 1],
        "duration": 0.5,
        "start": (frame.saturating_sub(1)) as f64 * 0.5,
        "is_final": is_final,
        "speech_final": speech_final,
        "from_finalize": from_finalize,
        "channel": {
            "alternatives": [{
                "transcript": transcript,
                "confidence": 0.96,
                "words": [],
            }]
        }
    })
    .to_string()
}
