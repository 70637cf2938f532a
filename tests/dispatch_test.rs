//! End-to-end dispatch through the relay engine

mod common;

use common::{CannedModel, RecordingNetwork, BOT_JID, GROUP};
use sasi_relay::channels::InboundEvent;
use sasi_relay::{Config, Models, Rejection, RelayEngine, SqliteMemoryStore};
use std::sync::Arc;
use tempfile::TempDir;

fn engine(network: Arc<RecordingNetwork>, dir: &TempDir) -> Arc<RelayEngine> {
    let mut config = Config::default();
    config.bot.allowed_groups = vec!["*".to_string()];
    config.memory.write_retry_backoff_ms = 1;
    let storage = Arc::new(SqliteMemoryStore::open(&dir.path().join("memories.db")).unwrap());
    let models = Models {
        chat: Arc::new(CannedModel("Sunny all day")),
        vision: Arc::new(CannedModel("A cat on a sofa")),
    };
    RelayEngine::with_models(&config, network, storage, models)
}

#[tokio::test]
async fn test_mention_gets_a_threaded_reply() {
    let dir = TempDir::new().unwrap();
    let network = Arc::new(RecordingNetwork::new());
    let engine = engine(network.clone(), &dir);

    let event = InboundEvent::text("M1", GROUP, "919000000001@s.whatsapp.net", "@sasi how is the weather?");
    engine.handle_event(event).await.unwrap().await.unwrap();

    assert_eq!(network.sent_texts(), vec!["Sunny all day".to_string()]);
    let conversation_id = format!("whatsapp-{}", GROUP);
    let conversation = engine.context().registry.get(&conversation_id).await.unwrap();
    assert_eq!(conversation.name, "Family");
    assert!(conversation.transcript.iter().any(|l| l.contains("Sunny all day")));
}

#[tokio::test]
async fn test_reply_to_bot_without_wake_word_is_chat() {
    let dir = TempDir::new().unwrap();
    let network = Arc::new(RecordingNetwork::new());
    let engine = engine(network.clone(), &dir);

    let event = InboundEvent::text("M2", GROUP, "919000000001@s.whatsapp.net", "and tomorrow?")
        .replying_to("OUT1", BOT_JID);
    engine.handle_event(event).await.unwrap().await.unwrap();

    assert_eq!(network.sent_texts().len(), 1);
}

#[tokio::test]
async fn test_redelivered_message_is_handled_once() {
    let dir = TempDir::new().unwrap();
    let network = Arc::new(RecordingNetwork::new());
    let engine = engine(network.clone(), &dir);

    let event = InboundEvent::text("M3", GROUP, "919000000001@s.whatsapp.net", "sasi hello there");
    engine.handle_event(event.clone()).await.unwrap().await.unwrap();
    let second = engine.handle_event(event).await;

    assert!(matches!(second, Err(Rejection::Duplicate)));
    assert_eq!(network.sent_texts().len(), 1);
}

#[tokio::test]
async fn test_disconnected_client_drops_without_marking_seen() {
    let dir = TempDir::new().unwrap();
    let network = Arc::new(RecordingNetwork::new());
    let engine = engine(network.clone(), &dir);
    let event = InboundEvent::text("M4", GROUP, "919000000001@s.whatsapp.net", "sasi ping");

    network.set_connected(false);
    assert!(matches!(engine.handle_event(event.clone()).await, Err(Rejection::NotConnected)));

    network.set_connected(true);
    engine.handle_event(event).await.unwrap().await.unwrap();
    assert_eq!(network.sent_texts().len(), 1);
}

#[tokio::test]
async fn test_plain_group_chatter_is_ignored() {
    let dir = TempDir::new().unwrap();
    let network = Arc::new(RecordingNetwork::new());
    let engine = engine(network.clone(), &dir);

    let event = InboundEvent::text("M5", GROUP, "919000000001@s.whatsapp.net", "dinner at 8?");
    assert!(matches!(engine.handle_event(event).await, Err(Rejection::Unrouted(_))));
    assert!(network.sent_texts().is_empty());
}
