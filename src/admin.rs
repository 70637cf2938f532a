//! Admin Operations
//!
//! Inspection and editing of conversations, session memories and the group
//! allow-list. Backs the `/admin` HTTP endpoints.
//!
//! Memory edits address a conversation's memories by a flattened index:
//! users sorted by ID, each user's memories in session order.

use crate::channels::ChannelError;
use crate::engine::RelayEngine;
use crate::memory::{StorageError, StoredMemory};
use crate::session::{Memory, SessionKey};
use crate::sync::SyncReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("network error: {0}")]
    Channel(#[from] ChannelError),
}

/// Per-conversation memory overview
#[derive(Debug, Clone, Serialize)]
pub struct ConversationMemorySummary {
    pub conversation_id: String,
    pub name: String,
    pub memory_count: usize,
    pub context_count: usize,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationDetails {
    pub conversation_id: String,
    pub chat_id: String,
    pub name: String,
    pub transcript: Vec<String>,
    pub users: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// One user's in-memory session
#[derive(Debug, Clone, Serialize)]
pub struct UserSession {
    pub user_id: String,
    pub memories: Vec<Memory>,
    pub context: Vec<String>,
}

/// A joined group and whether the bot answers there
#[derive(Debug, Clone, Serialize)]
pub struct GroupInfo {
    pub id: String,
    pub name: String,
    pub member_count: usize,
    pub allowed: bool,
}

#[derive(Clone)]
pub struct Admin {
    engine: Arc<RelayEngine>,
}

impl Admin {
    pub fn new(engine: Arc<RelayEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<RelayEngine> {
        &self.engine
    }

    pub async fn memory_summaries(&self) -> Vec<ConversationMemorySummary> {
        let ctx = self.engine.context();
        ctx.registry
            .list()
            .await
            .into_iter()
            .map(|c| {
                let (memory_count, context_count) = ctx.sessions.conversation_counts(&c.id);
                ConversationMemorySummary {
                    conversation_id: c.id,
                    name: c.name,
                    memory_count,
                    context_count,
                    last_activity: c.last_activity,
                }
            })
            .collect()
    }

    pub async fn conversation_details(&self, conversation_id: &str) -> Result<ConversationDetails, AdminError> {
        let conversation = self
            .engine
            .context()
            .registry
            .get(conversation_id)
            .await
            .ok_or_else(|| AdminError::UnknownConversation(conversation_id.to_string()))?;
        let users = self.users_in_conversation(conversation_id)?;

        Ok(ConversationDetails {
            conversation_id: conversation.id,
            chat_id: conversation.chat_id,
            name: conversation.name,
            transcript: conversation.transcript.into_iter().collect(),
            users,
            created_at: conversation.created_at,
            last_activity: conversation.last_activity,
        })
    }

    /// Users with live sessions or persisted memories, sorted
    pub fn users_in_conversation(&self, conversation_id: &str) -> Result<Vec<String>, AdminError> {
        let ctx = self.engine.context();
        let mut users: BTreeSet<String> = ctx
            .sessions
            .keys_in_conversation(conversation_id)
            .into_iter()
            .map(|k| k.user_id)
            .collect();
        users.extend(ctx.memory_sync.storage().users_in_conversation(conversation_id)?);
        Ok(users.into_iter().collect())
    }

    /// Live session state without marking memories as used
    pub fn user_memories(&self, conversation_id: &str, user_id: &str) -> UserSession {
        let key = SessionKey::new(user_id, conversation_id);
        let sessions = &self.engine.context().sessions;
        UserSession {
            user_id: user_id.to_string(),
            memories: sessions.snapshot_memories(&key),
            context: sessions.get_context(&key),
        }
    }

    pub fn persisted_memories(&self, conversation_id: &str, user_id: &str) -> Result<Vec<StoredMemory>, AdminError> {
        Ok(self
            .engine
            .memory_sync()
            .storage()
            .list_by_user(user_id, conversation_id)?)
    }

    /// Add a fact for a user. Returns false for an unknown conversation.
    pub async fn add_memory(&self, conversation_id: &str, user_id: &str, content: &str) -> Result<bool, AdminError> {
        if content.trim().is_empty() || !self.engine.context().registry.contains(conversation_id).await {
            return Ok(false);
        }
        let key = SessionKey::new(user_id, conversation_id);
        self.engine.memory_sync().remember(&key, content).await?;
        info!("Admin added memory for {}", key);
        Ok(true)
    }

    /// Resolve a flattened index to (key, index within that key)
    fn locate(&self, conversation_id: &str, index: usize) -> Option<(SessionKey, Memory, usize)> {
        let sessions = &self.engine.context().sessions;
        let mut remaining = index;
        for key in sessions.keys_in_conversation(conversation_id) {
            let memories = sessions.snapshot_memories(&key);
            if remaining < memories.len() {
                let memory = memories[remaining].clone();
                return Some((key, memory, remaining));
            }
            remaining -= memories.len();
        }
        None
    }

    /// Rewrite a memory in the session and in storage
    pub fn update_memory(&self, conversation_id: &str, index: usize, content: &str) -> Result<bool, AdminError> {
        let Some((key, old, local)) = self.locate(conversation_id, index) else {
            return Ok(false);
        };
        let ctx = self.engine.context();
        if !ctx.sessions.update_memory(&key, local, content) {
            return Ok(false);
        }

        if let Err(e) = self.persist_update(&key, &old, content) {
            // Keep the session in step with storage
            ctx.sessions.update_memory(&key, local, &old.content);
            warn!("Admin update of memory {} in {} rolled back: {}", index, conversation_id, e);
            return Err(e.into());
        }
        info!("Admin updated memory {} in {}", index, conversation_id);
        Ok(true)
    }

    fn persist_update(&self, key: &SessionKey, old: &Memory, content: &str) -> Result<(), StorageError> {
        let sync = self.engine.memory_sync();
        let storage = sync.storage();
        let persisted = storage
            .list_by_user(&key.user_id, &key.conversation_id)?
            .into_iter()
            .find(|row| row.record.content == old.content);
        match persisted {
            Some(row) => storage.update_content(row.id, content.trim()).map(|_| ()),
            None => sync.sync_session(key).map(|_| ()),
        }
    }

    /// Remove a memory from the session and from storage
    pub fn delete_memory(&self, conversation_id: &str, index: usize) -> Result<bool, AdminError> {
        let Some((key, _, local)) = self.locate(conversation_id, index) else {
            return Ok(false);
        };
        let ctx = self.engine.context();
        let Some(removed) = ctx.sessions.delete_memory(&key, local) else {
            return Ok(false);
        };

        let storage = ctx.memory_sync.storage();
        for row in storage.list_by_user(&key.user_id, &key.conversation_id)? {
            if row.record.content == removed.content {
                storage.delete_by_id(row.id)?;
            }
        }
        info!("Admin deleted memory {} in {}", index, conversation_id);
        Ok(true)
    }

    /// Drop every session and persisted memory in a conversation.
    ///
    /// Returns the number of persisted rows deleted.
    pub fn clear_memories(&self, conversation_id: &str) -> Result<usize, AdminError> {
        let ctx = self.engine.context();
        let storage = ctx.memory_sync.storage();

        let mut users: BTreeSet<String> = ctx
            .sessions
            .clear_conversation(conversation_id)
            .into_iter()
            .map(|k| k.user_id)
            .collect();
        users.extend(storage.users_in_conversation(conversation_id)?);

        let mut deleted = 0;
        for user in &users {
            deleted += storage.delete_all_for_user(user, conversation_id)?;
        }
        info!(
            "Admin cleared {} users ({} stored memories) in {}",
            users.len(),
            deleted,
            conversation_id
        );
        Ok(deleted)
    }

    pub fn delete_context_line(&self, conversation_id: &str, user_id: &str, index: usize) -> bool {
        self.engine
            .context()
            .sessions
            .delete_context_line(&SessionKey::new(user_id, conversation_id), index)
    }

    /// Joined groups with their allow-list status
    pub async fn groups(&self) -> Result<Vec<GroupInfo>, AdminError> {
        let groups = self.engine.client().joined_groups().await?;
        Ok(groups
            .into_iter()
            .map(|g| GroupInfo {
                allowed: self.engine.is_allowed(&g.id),
                id: g.id,
                name: g.name,
                member_count: g.member_count,
            })
            .collect())
    }

    pub fn update_allowed_groups(&self, groups: Vec<String>) {
        let groups = groups
            .into_iter()
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .collect();
        self.engine.set_allowed_groups(groups);
    }

    /// Run a persistence sweep now
    pub async fn sync_now(&self) -> SyncReport {
        self.engine.memory_sync().clone().sweep_blocking().await
    }
}
