//! Relay Engine
//!
//! Entry point for every inbound event. Admission runs inline in the
//! delivering task, in order:
//!
//! 1. connection check
//! 2. dedup by message ID
//! 3. group-only
//! 4. allow-list
//! 5. conversation registration
//! 6. reply-to-bot detection
//! 7. intent routing
//!
//! The chosen pipeline then runs on its own task so a slow collaborator never
//! blocks delivery of the next event. Pipeline tasks stop early on shutdown.

use crate::channels::{InboundEvent, NetworkClient, TokenBucket};
use crate::config::Config;
use crate::conversation::ConversationRegistry;
use crate::dedup::DedupGuard;
use crate::dispatcher::OutboundDispatcher;
use crate::memory::MemoryStorage;
use crate::pipelines::{
    CannedReplies, ChatModel, ChatPipeline, ImageAnalysisPipeline, ImageEditPipeline, ImageGenerationPipeline,
    OllamaClient, Pipeline, PipelineContext, Turn, WebhookPipeline,
};
use crate::reply::is_reply_to_bot;
use crate::router::{DropReason, Intent, IntentRouter, Route};
use crate::session::{SessionKey, SessionStore};
use crate::sync::MemorySync;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Why an event was not handed to a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotConnected,
    Duplicate,
    NotGroup,
    NotAllowed,
    Unrouted(DropReason),
    ShuttingDown,
}

/// Event counters
#[derive(Debug, Default)]
struct EngineCounters {
    received: AtomicU64,
    dispatched: AtomicU64,
    rejected: AtomicU64,
    pipeline_failures: AtomicU64,
}

/// Point-in-time engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub received: u64,
    pub dispatched: u64,
    pub rejected: u64,
    pub pipeline_failures: u64,
    pub duplicates: u64,
    pub replies_sent: u64,
    pub replies_failed: u64,
}

/// Language models used by the chat and vision pipelines
pub struct Models {
    pub chat: Arc<dyn ChatModel>,
    pub vision: Arc<dyn ChatModel>,
}

impl Models {
    pub fn ollama(config: &Config) -> Self {
        Self {
            chat: Arc::new(OllamaClient::new(config.llm.clone(), "chat")),
            vision: Arc::new(OllamaClient::new(config.vision.llm_config(), "vision")),
        }
    }
}

pub struct RelayEngine {
    client: Arc<dyn NetworkClient>,
    dedup: DedupGuard,
    allowed_groups: RwLock<Vec<String>>,
    ctx: PipelineContext,
    pipelines: HashMap<Intent, Arc<dyn Pipeline>>,
    shutdown: watch::Sender<bool>,
    counters: EngineCounters,
}

impl RelayEngine {
    pub fn new(config: &Config, client: Arc<dyn NetworkClient>, storage: Arc<dyn MemoryStorage>) -> Arc<Self> {
        Self::with_models(config, client, storage, Models::ollama(config))
    }

    pub fn with_models(
        config: &Config,
        client: Arc<dyn NetworkClient>,
        storage: Arc<dyn MemoryStorage>,
        models: Models,
    ) -> Arc<Self> {
        let sessions = Arc::new(SessionStore::new(
            config.memory.context_window,
            config.memory.max_memories_per_session,
        ));
        let ctx = PipelineContext {
            dispatcher: Arc::new(OutboundDispatcher::new(
                client.clone(),
                Arc::new(TokenBucket::new(&config.rate_limit)),
                Duration::from_secs(config.bridge.request_timeout_secs),
            )),
            registry: Arc::new(ConversationRegistry::new()),
            sessions: sessions.clone(),
            memory_sync: MemorySync::new(sessions, storage, config.memory.clone()),
            router: Arc::new(IntentRouter::new(&config.bot, config.enabled_pipelines())),
        };

        let canned = CannedReplies::new(&config.bot.bot_name, &config.bot.creator, &config.bot.model_alias);
        let pipelines: Vec<Arc<dyn Pipeline>> = vec![
            Arc::new(ChatPipeline::new(
                ctx.clone(),
                models.chat,
                canned,
                Duration::from_secs(config.llm.timeout_secs),
            )),
            Arc::new(ImageAnalysisPipeline::new(ctx.clone(), models.vision, &config.vision)),
            Arc::new(ImageGenerationPipeline::new(ctx.clone(), config.image_gen.clone())),
            Arc::new(ImageEditPipeline::new(ctx.clone(), config.comfy.clone())),
            Arc::new(WebhookPipeline::family(ctx.clone(), config.family.clone())),
            Arc::new(WebhookPipeline::food(ctx.clone(), config.food.clone())),
            Arc::new(WebhookPipeline::web(ctx.clone(), config.web.clone())),
        ];
        let pipelines = pipelines.into_iter().map(|p| (p.intent(), p)).collect();

        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            client,
            dedup: DedupGuard::new(&config.dedup),
            allowed_groups: RwLock::new(config.bot.allowed_groups.clone()),
            ctx,
            pipelines,
            shutdown,
            counters: EngineCounters::default(),
        })
    }

    pub fn client(&self) -> &Arc<dyn NetworkClient> {
        &self.client
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn memory_sync(&self) -> &Arc<MemorySync> {
        &self.ctx.memory_sync
    }

    pub fn allowed_groups(&self) -> Vec<String> {
        self.allowed_groups.read().clone()
    }

    /// Replace the allow-list; takes effect for the next event
    pub fn set_allowed_groups(&self, groups: Vec<String>) {
        info!("Allowed groups updated: {:?}", groups);
        *self.allowed_groups.write() = groups;
    }

    pub fn is_allowed(&self, chat_id: &str) -> bool {
        self.allowed_groups
            .read()
            .iter()
            .any(|entry| entry == "*" || (!entry.is_empty() && chat_id.contains(entry.as_str())))
    }

    /// Subscribe to the shutdown flag
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Flip the shutdown flag; running pipelines abort
    pub fn shutdown(&self) {
        info!("Relay engine shutting down");
        self.shutdown.send_replace(true);
    }

    pub fn stats(&self) -> EngineStats {
        let dispatch = self.ctx.dispatcher.stats();
        EngineStats {
            received: self.counters.received.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            pipeline_failures: self.counters.pipeline_failures.load(Ordering::Relaxed),
            duplicates: self.dedup.stats().duplicates,
            replies_sent: dispatch.sent.load(Ordering::Relaxed),
            replies_failed: dispatch.failed.load(Ordering::Relaxed),
        }
    }

    /// Admit and classify an event without running anything
    pub async fn admit(&self, event: InboundEvent) -> Result<(Intent, Turn), Rejection> {
        if self.is_shutting_down() {
            return Err(Rejection::ShuttingDown);
        }
        if !self.client.is_connected() {
            warn!("Dropping event {}: network client not connected", event.id);
            return Err(Rejection::NotConnected);
        }
        if !self.dedup.mark_if_new(&event.id).await {
            return Err(Rejection::Duplicate);
        }
        if !event.is_group_chat() {
            debug!("Ignoring direct message {} from {}", event.id, event.sender_id());
            return Err(Rejection::NotGroup);
        }
        if !self.is_allowed(event.chat_id()) {
            debug!("Ignoring message from group {} (not allowed)", event.chat_id());
            return Err(Rejection::NotAllowed);
        }

        let conversation_id = self
            .ctx
            .registry
            .get_or_create(event.chat_id(), self.client.as_ref())
            .await;

        let own_identity = self.client.own_identity();
        let is_reply = is_reply_to_bot(&event, own_identity.as_deref());
        let text = event.extract_text().map(str::to_string);

        let intent = match self.ctx.router.route(text.as_deref(), event.has_image(), is_reply) {
            Route::Dispatch(intent) => intent,
            Route::Drop(reason) => {
                debug!("Dropping event {}: {:?}", event.id, reason);
                return Err(Rejection::Unrouted(reason));
            }
        };

        let turn = Turn {
            session: SessionKey::new(event.sender_id(), &conversation_id),
            conversation_id,
            text,
            is_reply_to_bot: is_reply,
            event,
        };
        Ok((intent, turn))
    }

    /// Admit an event and run its pipeline on a new task
    pub async fn handle_event(self: &Arc<Self>, event: InboundEvent) -> Result<JoinHandle<()>, Rejection> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        match self.admit(event).await {
            Ok((intent, turn)) => {
                self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                Ok(self.clone().spawn_pipeline(intent, turn))
            }
            Err(rejection) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(rejection)
            }
        }
    }

    fn spawn_pipeline(self: Arc<Self>, intent: Intent, turn: Turn) -> JoinHandle<()> {
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let Some(pipeline) = self.pipelines.get(&intent).cloned() else {
                warn!("No pipeline registered for {}", intent.as_str());
                return;
            };
            info!("Handling {} from {} via {}", turn.event.id, turn.session, intent.as_str());

            tokio::select! {
                result = pipeline.run(&turn) => {
                    if let Err(e) = result {
                        self.counters.pipeline_failures.fetch_add(1, Ordering::Relaxed);
                        warn!("{} pipeline failed for {}: {}", intent.as_str(), turn.event.id, e);
                        if let Err(send_err) = self.ctx.dispatcher.send_raw(&e.user_message(), &turn.event).await {
                            debug!("Could not deliver error reply: {}", send_err);
                        }
                    }
                }
                // The watch guard is !Send, drop it before leaving the arm
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    info!("Abandoning {} for {} on shutdown", intent.as_str(), turn.event.id);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SqliteMemoryStore;
    use crate::testing::{FakeModel, FakeNetwork, BOT_JID};

    fn config() -> Config {
        let mut config = Config::default();
        config.bot.allowed_groups = vec!["1203".to_string()];
        config
    }

    fn engine(network: Arc<FakeNetwork>, config: &Config) -> Arc<RelayEngine> {
        RelayEngine::with_models(
            config,
            network,
            Arc::new(SqliteMemoryStore::open_in_memory().unwrap()),
            Models {
                chat: Arc::new(FakeModel::new("Sunny all day")),
                vision: Arc::new(FakeModel::new("A picture")),
            },
        )
    }

    #[tokio::test]
    async fn test_admission_order() {
        let network = Arc::new(FakeNetwork::new());
        let engine = engine(network.clone(), &config());

        let event = InboundEvent::text("M1", "1203@g.us", "alice", "@sasi hi");
        let (intent, turn) = engine.admit(event.clone()).await.unwrap();
        assert_eq!(intent, Intent::Chat);
        assert_eq!(turn.conversation_id, "whatsapp-1203@g.us");
        assert_eq!(turn.session, SessionKey::new("alice", "whatsapp-1203@g.us"));

        assert_eq!(engine.admit(event).await.unwrap_err(), Rejection::Duplicate);

        let mut direct = InboundEvent::text("M2", "4477@s.whatsapp.net", "alice", "@sasi hi");
        direct.is_group = false;
        assert_eq!(engine.admit(direct).await.unwrap_err(), Rejection::NotGroup);

        let other = InboundEvent::text("M3", "9999@g.us", "alice", "@sasi hi");
        assert_eq!(engine.admit(other).await.unwrap_err(), Rejection::NotAllowed);

        let chatter = InboundEvent::text("M4", "1203@g.us", "alice", "lunch?");
        assert_eq!(
            engine.admit(chatter).await.unwrap_err(),
            Rejection::Unrouted(DropReason::NoTrigger)
        );
    }

    #[tokio::test]
    async fn test_disconnected_events_are_not_marked_seen() {
        let network = Arc::new(FakeNetwork::new());
        let engine = engine(network.clone(), &config());
        let event = InboundEvent::text("M1", "1203@g.us", "alice", "@sasi hi");

        network.set_connected(false);
        assert_eq!(engine.admit(event.clone()).await.unwrap_err(), Rejection::NotConnected);

        network.set_connected(true);
        assert!(engine.admit(event).await.is_ok());
    }

    #[tokio::test]
    async fn test_allow_list_rules() {
        let network = Arc::new(FakeNetwork::new());
        let engine = engine(network, &config());

        assert!(engine.is_allowed("1203@g.us"));
        engine.set_allowed_groups(vec![]);
        assert!(!engine.is_allowed("1203@g.us"));
        engine.set_allowed_groups(vec!["*".to_string()]);
        assert!(engine.is_allowed("anything@g.us"));
    }

    #[tokio::test]
    async fn test_reply_to_bot_without_wake_word() {
        let network = Arc::new(FakeNetwork::new());
        let engine = engine(network.clone(), &config());

        let event = InboundEvent::text("M1", "1203@g.us", "alice", "and tomorrow?").replying_to("OUT1", BOT_JID);
        let handle = engine.handle_event(event).await.unwrap();
        handle.await.unwrap();

        assert_eq!(network.sent_texts(), vec!["Sunny all day"]);
    }

    #[tokio::test]
    async fn test_pipeline_failure_sends_apology() {
        let network = Arc::new(FakeNetwork::new());
        let mut cfg = config();
        cfg.food.enabled = true;
        cfg.food.webhook_url = "http://127.0.0.1:9/food".to_string();
        let engine = engine(network.clone(), &cfg);

        let unaddressed = InboundEvent::text("M0", "1203@g.us", "alice", "@food biryani");
        assert_eq!(
            engine.handle_event(unaddressed).await.unwrap_err(),
            Rejection::Unrouted(DropReason::NoTrigger)
        );

        let event = InboundEvent::text("M1", "1203@g.us", "alice", "@sasi @food biryani");
        engine.handle_event(event).await.unwrap().await.unwrap();

        assert_eq!(
            network.sent_texts(),
            vec!["Sorry, I couldn't connect to the food service. Please try again later."]
        );
        assert_eq!(engine.stats().pipeline_failures, 1);
    }

    struct StalledModel;

    #[async_trait::async_trait]
    impl ChatModel for StalledModel {
        async fn complete(&self, _prompt: &str, _images: &[Vec<u8>]) -> Result<String, crate::pipelines::PipelineError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("too late".to_string())
        }
    }

    #[tokio::test]
    async fn test_shutdown_abandons_in_flight_pipeline() {
        let network = Arc::new(FakeNetwork::new());
        let engine = RelayEngine::with_models(
            &config(),
            network.clone(),
            Arc::new(SqliteMemoryStore::open_in_memory().unwrap()),
            Models {
                chat: Arc::new(StalledModel),
                vision: Arc::new(StalledModel),
            },
        );

        let event = InboundEvent::text("M1", "1203@g.us", "alice", "@sasi are you there?");
        let handle = engine.handle_event(event).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.shutdown();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("pipeline task should stop on shutdown")
            .unwrap();
        assert!(network.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_events() {
        let network = Arc::new(FakeNetwork::new());
        let engine = engine(network, &config());
        engine.shutdown();

        let event = InboundEvent::text("M1", "1203@g.us", "alice", "@sasi hi");
        assert_eq!(engine.handle_event(event).await.unwrap_err(), Rejection::ShuttingDown);
        assert_eq!(engine.stats().rejected, 1);
    }
}
