//! Conversation Registry
//!
//! Maps a network chat identifier to a logical conversation record: display
//! name, rolling transcript and last activity. Unlike the session store, which
//! is scoped per user, this holds the shared group-level history.

use crate::channels::NetworkClient;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Maximum transcript lines kept per conversation (rolling window)
pub const MAX_TRANSCRIPT_LINES: usize = 50;

/// Conversation record
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub chat_id: String,
    pub name: String,
    pub transcript: VecDeque<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Summary of a conversation
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub chat_id: String,
    pub name: String,
    pub transcript_len: usize,
    pub last_activity: DateTime<Utc>,
}

/// Stable conversation ID for a network chat
pub fn conversation_id(network: &str, chat_id: &str) -> String {
    format!("{}-{}", network, chat_id)
}

/// Registry of every conversation seen by this process
pub struct ConversationRegistry {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
        }
    }

    /// Look up the conversation for `chat_id`, creating it on first sight.
    ///
    /// The display name comes from the network's group metadata and falls back
    /// to the raw chat ID when the lookup fails.
    pub async fn get_or_create(&self, chat_id: &str, client: &dyn NetworkClient) -> String {
        let id = conversation_id(client.name(), chat_id);

        {
            let mut conversations = self.conversations.write().await;
            if let Some(conversation) = conversations.get_mut(&id) {
                conversation.last_activity = Utc::now();
                return id;
            }
        }

        // Resolve the name without holding the lock
        let name = match client.group_metadata(chat_id).await {
            Ok(meta) if !meta.name.trim().is_empty() => meta.name,
            Ok(_) => chat_id.to_string(),
            Err(e) => {
                warn!("Group name lookup failed for {}: {}", chat_id, e);
                chat_id.to_string()
            }
        };

        let mut conversations = self.conversations.write().await;
        conversations.entry(id.clone()).or_insert_with(|| {
            info!("New conversation {} ({})", id, name);
            let now = Utc::now();
            Conversation {
                id: id.clone(),
                chat_id: chat_id.to_string(),
                name,
                transcript: VecDeque::new(),
                created_at: now,
                last_activity: now,
            }
        });
        id
    }

    /// Append a transcript line, keeping the last 50
    pub async fn record(&self, conversation_id: &str, line: &str) -> bool {
        let mut conversations = self.conversations.write().await;
        let Some(conversation) = conversations.get_mut(conversation_id) else {
            debug!("Record for unknown conversation {}", conversation_id);
            return false;
        };

        conversation.transcript.push_back(line.to_string());
        while conversation.transcript.len() > MAX_TRANSCRIPT_LINES {
            conversation.transcript.pop_front();
        }
        conversation.last_activity = Utc::now();
        true
    }

    pub async fn get(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations.read().await.get(conversation_id).cloned()
    }

    pub async fn contains(&self, conversation_id: &str) -> bool {
        self.conversations.read().await.contains_key(conversation_id)
    }

    /// All conversations, most recently active first
    pub async fn list(&self) -> Vec<ConversationSummary> {
        let conversations = self.conversations.read().await;
        let mut summaries: Vec<ConversationSummary> = conversations
            .values()
            .map(|c| ConversationSummary {
                id: c.id.clone(),
                chat_id: c.chat_id.clone(),
                name: c.name.clone(),
                transcript_len: c.transcript.len(),
                last_activity: c.last_activity,
            })
            .collect();
        summaries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        summaries
    }

    pub async fn len(&self) -> usize {
        self.conversations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conversations.read().await.is_empty()
    }
}

impl Default for ConversationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
