//! Test doubles shared by unit tests

use crate::channels::{
    decode_inline_media, ChannelError, GroupMetadata, InboundEvent, MediaPayload, MediaRef, NetworkClient,
    RateLimitConfig, ReplyMeta, TokenBucket,
};
use crate::config::BotConfig;
use crate::conversation::ConversationRegistry;
use crate::dispatcher::OutboundDispatcher;
use crate::memory::SqliteMemoryStore;
use crate::pipelines::{ChatModel, PipelineContext, PipelineError, Turn};
use crate::router::{EnabledPipelines, IntentRouter};
use crate::session::{SessionKey, SessionStore};
use crate::sync::{MemoryConfig, MemorySync};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const BOT_JID: &str = "15550000:4@s.whatsapp.net";

#[derive(Debug, Clone)]
pub enum Sent {
    Text {
        chat_id: String,
        text: String,
        reply: Option<ReplyMeta>,
    },
    Image {
        chat_id: String,
        caption: String,
        bytes: Vec<u8>,
    },
}

/// Recording network client
pub struct FakeNetwork {
    connected: AtomicBool,
    fail: AtomicBool,
    groups: Mutex<HashMap<String, String>>,
    sent: Mutex<Vec<Sent>>,
    uploads: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            fail: AtomicBool::new(false),
            groups: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            uploads: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_group(&self, chat_id: &str, name: &str) {
        self.groups.lock().insert(chat_id.to_string(), name.to_string());
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Text { text, .. } => Some(text.clone()),
                Sent::Image { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl NetworkClient for FakeNetwork {
    fn name(&self) -> &str {
        "whatsapp"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn own_identity(&self) -> Option<String> {
        Some(BOT_JID.to_string())
    }

    async fn send_text(&self, chat_id: &str, text: &str, reply: Option<&ReplyMeta>) -> Result<String, ChannelError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChannelError::SendFailed("fake failure".to_string()));
        }
        let mut sent = self.sent.lock();
        sent.push(Sent::Text {
            chat_id: chat_id.to_string(),
            text: text.to_string(),
            reply: reply.cloned(),
        });
        Ok(format!("OUT{}", sent.len()))
    }

    async fn upload_media(&self, bytes: Vec<u8>, mime_type: &str) -> Result<MediaRef, ChannelError> {
        let mut uploads = self.uploads.lock();
        let id = format!("media-{}", uploads.len() + 1);
        uploads.insert(id.clone(), bytes);
        Ok(MediaRef {
            id,
            mime_type: mime_type.to_string(),
        })
    }

    async fn send_image(
        &self,
        chat_id: &str,
        media: &MediaRef,
        caption: &str,
        _reply: Option<&ReplyMeta>,
    ) -> Result<String, ChannelError> {
        let bytes = self
            .uploads
            .lock()
            .get(&media.id)
            .cloned()
            .ok_or_else(|| ChannelError::SendFailed("unknown media".to_string()))?;
        let mut sent = self.sent.lock();
        sent.push(Sent::Image {
            chat_id: chat_id.to_string(),
            caption: caption.to_string(),
            bytes,
        });
        Ok(format!("OUT{}", sent.len()))
    }

    async fn group_metadata(&self, chat_id: &str) -> Result<GroupMetadata, ChannelError> {
        self.groups
            .lock()
            .get(chat_id)
            .map(|name| GroupMetadata {
                id: chat_id.to_string(),
                name: name.clone(),
                member_count: 3,
            })
            .ok_or_else(|| ChannelError::GroupLookupFailed(chat_id.to_string()))
    }

    async fn joined_groups(&self) -> Result<Vec<GroupMetadata>, ChannelError> {
        let mut groups: Vec<GroupMetadata> = self
            .groups
            .lock()
            .iter()
            .map(|(id, name)| GroupMetadata {
                id: id.clone(),
                name: name.clone(),
                member_count: 3,
            })
            .collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(groups)
    }

    async fn download_media(&self, media: &MediaPayload) -> Result<Vec<u8>, ChannelError> {
        decode_inline_media(media)
    }
}

/// Chat model that echoes a canned answer and records prompts
pub struct FakeModel {
    pub answer: String,
    pub prompts: Mutex<Vec<String>>,
}

impl FakeModel {
    pub fn new(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl ChatModel for FakeModel {
    async fn complete(&self, prompt: &str, _images: &[Vec<u8>]) -> Result<String, PipelineError> {
        self.prompts.lock().push(prompt.to_string());
        Ok(self.answer.clone())
    }
}

/// Pipeline context over a fake network and in-memory SQLite
pub fn pipeline_context(network: Arc<FakeNetwork>) -> PipelineContext {
    let sessions = Arc::new(SessionStore::default());
    let storage = Arc::new(SqliteMemoryStore::open_in_memory().unwrap());
    PipelineContext {
        dispatcher: Arc::new(OutboundDispatcher::new(
            network,
            Arc::new(TokenBucket::new(&RateLimitConfig::default())),
            Duration::from_secs(5),
        )),
        registry: Arc::new(ConversationRegistry::new()),
        sessions: sessions.clone(),
        memory_sync: MemorySync::new(
            sessions,
            storage,
            MemoryConfig {
                write_retry_backoff_ms: 1,
                ..Default::default()
            },
        ),
        router: Arc::new(IntentRouter::new(&BotConfig::default(), EnabledPipelines::default())),
    }
}

/// A turn for `event` in the conversation the registry assigns to its chat
pub async fn turn_for(ctx: &PipelineContext, event: InboundEvent, is_reply_to_bot: bool) -> Turn {
    let conversation_id = ctx
        .registry
        .get_or_create(event.chat_id(), ctx.dispatcher.client().as_ref())
        .await;
    Turn {
        session: SessionKey::new(event.sender_id(), &conversation_id),
        text: event.extract_text().map(str::to_string),
        conversation_id,
        is_reply_to_bot,
        event,
    }
}

/// Serve `app` on an ephemeral port and return its base URL
pub async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}
