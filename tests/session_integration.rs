//! Conversation session integration tests: state machine + mock upstreams.

mod mock_upstream;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use polyglot_gateway::config::GatewayConfig;
use polyglot_gateway::core::hub::OverflowPolicy;
use polyglot_gateway::core::translate::{Direction, Translator};
use polyglot_gateway::core::tts::TtsClient;
use polyglot_gateway::handlers::messages::{Outbound, ServerMessage};
use polyglot_gateway::session::conversation::{ConversationSession, Inbound};

use mock_upstream::{spawn_mock_stt, spawn_mock_translator, spawn_mock_tts, MockBehavior};

const STEP_WAIT: Duration = Duration::from_secs(8);

fn test_config() -> GatewayConfig {
    GatewayConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        tls: None,
        stt_api_key: "test-stt-key".to_string(),
        llm_api_key: "test-llm-key".to_string(),
        utterance_end_ms: 1000,
        endpointing_ms: 300,
        stop_grace: Duration::from_millis(200),
        hard_ceiling: Duration::from_secs(15),
        translate_timeout: Duration::from_secs(4),
        tts_timeout: Duration::from_secs(8),
        subscriber_queue: 32,
        overflow_policy: OverflowPolicy::DropOldest,
        max_sessions: 32,
        max_subscribers: 64,
        cors_allowed_origins: None,
    }
}

async fn next_outbound(rx: &mut mpsc::Receiver<Outbound>) -> Option<Outbound> {
    timeout(STEP_WAIT, rx.recv()).await.expect("outbound wait")
}

#[tokio::test]
async fn test_happy_path_conversation_orders_translation_before_audio() {
    let (stt_url, _stats) = spawn_mock_stt(MockBehavior::Transcribe).await;
    let translator_url = spawn_mock_translator("Hello, what is your name?", Duration::ZERO).await;
    let tts_url = spawn_mock_tts(&[0x49, 0x44, 0x33, 0x04]).await;

    let config = Arc::new(test_config());
    let translator =
        Translator::new("k".to_string(), config.translate_timeout).with_endpoint(translator_url);
    let tts = TtsClient::new(config.tts_timeout).with_endpoint(tts_url);

    let (outbound_tx, mut outbound_rx) = mpsc::channel(64);
    let (inbound_tx, inbound_rx) = mpsc::channel(64);

    let session = ConversationSession::new(
        Direction::CnToEn,
        config,
        translator,
        tts,
        outbound_tx,
    )
    .with_stt_endpoint(stt_url);
    let run = tokio::spawn(session.run(inbound_rx));

    // 2 frames of "speech", then the push-to-talk release
    inbound_tx
        .send(Inbound::Audio(Bytes::from_static(&[0u8; 640])))
        .await
        .unwrap();
    inbound_tx
        .send(Inbound::Audio(Bytes::from_static(&[0u8; 640])))
        .await
        .unwrap();
    inbound_tx.send(Inbound::Stop).await.unwrap();

    // Expect transcription updates, then exactly one translation, then
    // binary audio, in that order on the socket channel.
    let mut saw_update = false;
    let mut translation: Option<(String, String)> = None;

    loop {
        match next_outbound(&mut outbound_rx).await.expect("frame") {
            Outbound::Message(ServerMessage::TranscriptionUpdate { text }) => {
                assert!(!text.is_empty());
                saw_update = true;
            }
            Outbound::Message(ServerMessage::Translation {
                original,
                translation: translated,
            }) => {
                translation = Some((original, translated));
                break;
            }
            other => panic!("unexpected frame before translation: {other:?}"),
        }
    }

    assert!(saw_update, "no transcription_update before the translation");
    let (original, translated) = translation.unwrap();
    assert!(original.contains("committed"));
    assert_eq!(translated, "Hello, what is your name?");

    match next_outbound(&mut outbound_rx).await.expect("audio") {
        Outbound::Audio(data) => {
            assert!(!data.is_empty());
            assert_eq!(&data[..3], &[0x49, 0x44, 0x33]);
        }
        other => panic!("expected binary audio after translation, got {other:?}"),
    }

    // Back to Idle: the session survives for a second utterance
    inbound_tx.send(Inbound::Stop).await.unwrap();
    match next_outbound(&mut outbound_rx).await.expect("refused") {
        Outbound::Message(ServerMessage::Error { message }) => {
            assert_eq!(message, "TranslationRefused");
        }
        other => panic!("expected TranslationRefused, got {other:?}"),
    }

    inbound_tx.send(Inbound::Disconnected).await.unwrap();
    run.await.unwrap();
}

#[tokio::test]
async fn test_translator_failure_ends_utterance_not_session() {
    let (stt_url, _stats) = spawn_mock_stt(MockBehavior::Transcribe).await;

    let config = Arc::new(test_config());
    // Unreachable translator: the call fails fast
    let translator = Translator::new("k".to_string(), config.translate_timeout)
        .with_endpoint("http://127.0.0.1:1/".to_string());
    let tts = TtsClient::new(config.tts_timeout);

    let (outbound_tx, mut outbound_rx) = mpsc::channel(64);
    let (inbound_tx, inbound_rx) = mpsc::channel(64);

    let session = ConversationSession::new(
        Direction::EnToCn,
        config,
        translator,
        tts,
        outbound_tx,
    )
    .with_stt_endpoint(stt_url);
    let run = tokio::spawn(session.run(inbound_rx));

    inbound_tx
        .send(Inbound::Audio(Bytes::from_static(&[0u8; 640])))
        .await
        .unwrap();
    inbound_tx.send(Inbound::Stop).await.unwrap();

    // Skip transcription updates, expect the stage failure
    let error = loop {
        match next_outbound(&mut outbound_rx).await.expect("frame") {
            Outbound::Message(ServerMessage::TranscriptionUpdate { .. }) => continue,
            Outbound::Message(ServerMessage::Error { message }) => break message,
            other => panic!("unexpected frame: {other:?}"),
        }
    };
    assert_eq!(error, "TranslationFailed");

    // The session is still alive
    inbound_tx.send(Inbound::Stop).await.unwrap();
    match next_outbound(&mut outbound_rx).await.expect("refused") {
        Outbound::Message(ServerMessage::Error { message }) => {
            assert_eq!(message, "TranslationRefused");
        }
        other => panic!("expected TranslationRefused, got {other:?}"),
    }

    inbound_tx.send(Inbound::Disconnected).await.unwrap();
    run.await.unwrap();
}

#[tokio::test]
async fn test_hard_ceiling_cancels_a_stalled_translator() {
    let (stt_url, _stats) = spawn_mock_stt(MockBehavior::Transcribe).await;
    // The translator answers far too late; the ceiling must fire first
    let translator_url = spawn_mock_translator("late", Duration::from_secs(30)).await;

    let mut config = test_config();
    config.hard_ceiling = Duration::from_millis(2500);
    config.translate_timeout = Duration::from_secs(60);
    let config = Arc::new(config);

    let translator =
        Translator::new("k".to_string(), config.translate_timeout).with_endpoint(translator_url);
    let tts = TtsClient::new(config.tts_timeout);

    let (outbound_tx, mut outbound_rx) = mpsc::channel(64);
    let (inbound_tx, inbound_rx) = mpsc::channel(64);

    let session = ConversationSession::new(
        Direction::EnToCn,
        config,
        translator,
        tts,
        outbound_tx,
    )
    .with_stt_endpoint(stt_url);
    let run = tokio::spawn(session.run(inbound_rx));

    inbound_tx
        .send(Inbound::Audio(Bytes::from_static(&[0u8; 640])))
        .await
        .unwrap();
    inbound_tx.send(Inbound::Stop).await.unwrap();

    let error = loop {
        match next_outbound(&mut outbound_rx).await.expect("frame") {
            Outbound::Message(ServerMessage::TranscriptionUpdate { .. }) => continue,
            Outbound::Message(ServerMessage::Error { message }) => break message,
            Outbound::Audio(_) => panic!("no audio may be delivered after a ceiling abort"),
            other => panic!("unexpected frame: {other:?}"),
        }
    };
    assert_eq!(error, "Timeout");

    inbound_tx.send(Inbound::Disconnected).await.unwrap();
    run.await.unwrap();
}

#[tokio::test]
async fn test_client_disconnect_mid_pipeline_tears_down() {
    let (stt_url, _stats) = spawn_mock_stt(MockBehavior::Transcribe).await;
    let translator_url = spawn_mock_translator("slow", Duration::from_secs(30)).await;

    let config = Arc::new(test_config());
    let translator = Translator::new("k".to_string(), Duration::from_secs(60))
        .with_endpoint(translator_url);
    let tts = TtsClient::new(config.tts_timeout);

    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let (inbound_tx, inbound_rx) = mpsc::channel(64);

    let session = ConversationSession::new(
        Direction::EnToCn,
        config,
        translator,
        tts,
        outbound_tx,
    )
    .with_stt_endpoint(stt_url);
    let run = tokio::spawn(session.run(inbound_rx));

    inbound_tx
        .send(Inbound::Audio(Bytes::from_static(&[0u8; 640])))
        .await
        .unwrap();
    inbound_tx.send(Inbound::Stop).await.unwrap();

    // Let the machine reach Translating, then vanish
    tokio::time::sleep(Duration::from_millis(1200)).await;
    inbound_tx.send(Inbound::Disconnected).await.unwrap();

    // The session must end promptly, not after the 30 s translator stall
    timeout(Duration::from_secs(2), run)
        .await
        .expect("session failed to tear down after disconnect")
        .unwrap();
    drop(outbound_rx);
}
