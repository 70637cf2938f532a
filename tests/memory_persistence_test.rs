//! Session memory persistence across restarts

mod common;

use common::{CannedModel, RecordingNetwork, GROUP};
use sasi_relay::channels::InboundEvent;
use sasi_relay::{Config, MemoryStorage, Models, RelayEngine, SessionKey, SqliteMemoryStore};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::watch;

const USER: &str = "919000000001@s.whatsapp.net";

fn engine_on(path: &std::path::Path) -> (Arc<RelayEngine>, Arc<RecordingNetwork>) {
    let mut config = Config::default();
    config.bot.allowed_groups = vec![GROUP.to_string()];
    config.memory.write_retry_backoff_ms = 1;
    let network = Arc::new(RecordingNetwork::new());
    let storage = Arc::new(SqliteMemoryStore::open(path).unwrap());
    let models = Models {
        chat: Arc::new(CannedModel("ok")),
        vision: Arc::new(CannedModel("ok")),
    };
    (RelayEngine::with_models(&config, network.clone(), storage, models), network)
}

#[tokio::test]
async fn test_remembered_fact_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("memories.db");

    {
        let (engine, network) = engine_on(&db);
        let event = InboundEvent::text("R1", GROUP, USER, "sasi remember that I like filter coffee");
        engine.handle_event(event).await.unwrap().await.unwrap();
        assert_eq!(network.sent_texts(), vec!["Got it, I'll remember that. 🧠".to_string()]);
    }

    let reopened = SqliteMemoryStore::open(&db).unwrap();
    let conversation_id = format!("whatsapp-{}", GROUP);
    let stored = reopened.list_by_user(USER, &conversation_id).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].record.content, "I like filter coffee");
}

#[tokio::test]
async fn test_final_sweep_runs_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("memories.db");
    let (engine, _network) = engine_on(&db);

    let key = SessionKey::new(USER, &format!("whatsapp-{}", GROUP));
    assert!(engine.context().sessions.add_memory(&key, "Birthday is in March"));
    assert!(engine.context().sessions.add_memory(&key, "Works night shifts"));

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(engine.memory_sync().clone().run(rx));
    tx.send_replace(true);
    let report = task.await.unwrap();

    assert_eq!(report.failure_count, 0);
    assert_eq!(SqliteMemoryStore::open(&db).unwrap().count().unwrap(), 2);
}
