//! Session Memory Store
//!
//! Per-(user, conversation) memory facts and a short rolling context window.
//!
//! - Memories are unique per key by content; adding an existing fact refreshes it
//! - Reading memories through `get_memories` counts as a use
//! - The context window is a FIFO of the last few exchange lines
//!
//! A single store-wide read-write lock guards both maps.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use tracing::debug;

/// Default context lines kept per session
pub const DEFAULT_CONTEXT_WINDOW: usize = 10;

/// Default memory facts kept per session
pub const DEFAULT_MAX_MEMORIES: usize = 100;

/// Composite session identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub conversation_id: String,
}

impl SessionKey {
    pub fn new(user_id: &str, conversation_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.conversation_id)
    }
}

/// A remembered fact
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Memory {
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    /// Starts at 0 on insert
    pub use_count: u32,
}

impl Memory {
    fn new(content: &str) -> Self {
        let now = Utc::now();
        Self {
            content: content.to_string(),
            created_at: now,
            last_used: now,
            use_count: 0,
        }
    }
}

#[derive(Default)]
struct Sessions {
    memories: HashMap<SessionKey, Vec<Memory>>,
    contexts: HashMap<SessionKey, VecDeque<String>>,
}

/// Store statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub sessions: usize,
    pub memories: usize,
    pub context_lines: usize,
}

/// Concurrent session memory store
pub struct SessionStore {
    sessions: RwLock<Sessions>,
    context_window: usize,
    max_memories: usize,
}

impl SessionStore {
    pub fn new(context_window: usize, max_memories: usize) -> Self {
        Self {
            sessions: RwLock::new(Sessions::default()),
            context_window: context_window.max(1),
            max_memories: max_memories.max(1),
        }
    }

    /// Upsert a memory by content. Returns true if a new fact was stored.
    pub fn add_memory(&self, key: &SessionKey, content: &str) -> bool {
        let content = content.trim();
        if content.is_empty() {
            return false;
        }

        let mut sessions = self.sessions.write();
        let memories = sessions.memories.entry(key.clone()).or_default();

        if let Some(existing) = memories.iter_mut().find(|m| m.content == content) {
            existing.last_used = Utc::now();
            return false;
        }

        if memories.len() >= self.max_memories {
            // Evict the least recently used fact
            if let Some(lru) = memories
                .iter()
                .enumerate()
                .min_by_key(|(_, m)| m.last_used)
                .map(|(i, _)| i)
            {
                let evicted = memories.remove(lru);
                debug!("Evicted memory '{}' from {}", evicted.content, key);
            }
        }

        memories.push(Memory::new(content));
        true
    }

    /// Memories for a key. Each returned memory is marked as used.
    pub fn get_memories(&self, key: &SessionKey) -> Vec<Memory> {
        let mut sessions = self.sessions.write();
        let Some(memories) = sessions.memories.get_mut(key) else {
            return Vec::new();
        };

        let now = Utc::now();
        for memory in memories.iter_mut() {
            memory.use_count += 1;
            memory.last_used = now;
        }
        memories.clone()
    }

    /// Memories for a key without marking them as used
    pub fn snapshot_memories(&self, key: &SessionKey) -> Vec<Memory> {
        self.sessions
            .read()
            .memories
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn update_memory(&self, key: &SessionKey, index: usize, content: &str) -> bool {
        let content = content.trim();
        if content.is_empty() {
            return false;
        }

        let mut sessions = self.sessions.write();
        let Some(memories) = sessions.memories.get_mut(key) else {
            return false;
        };
        if memories
            .iter()
            .enumerate()
            .any(|(i, m)| i != index && m.content == content)
        {
            return false;
        }
        match memories.get_mut(index) {
            Some(memory) => {
                memory.content = content.to_string();
                memory.last_used = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn delete_memory(&self, key: &SessionKey, index: usize) -> Option<Memory> {
        let mut sessions = self.sessions.write();
        let memories = sessions.memories.get_mut(key)?;
        if index >= memories.len() {
            return None;
        }
        let removed = memories.remove(index);
        if memories.is_empty() {
            sessions.memories.remove(key);
        }
        Some(removed)
    }

    /// Append a context line, keeping the newest `context_window` lines
    pub fn add_context_line(&self, key: &SessionKey, line: &str) {
        let mut sessions = self.sessions.write();
        let context = sessions.contexts.entry(key.clone()).or_default();
        context.push_back(line.to_string());
        while context.len() > self.context_window {
            context.pop_front();
        }
    }

    /// Context lines, oldest first
    pub fn get_context(&self, key: &SessionKey) -> Vec<String> {
        self.sessions
            .read()
            .contexts
            .get(key)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn delete_context_line(&self, key: &SessionKey, index: usize) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.contexts.get_mut(key) {
            Some(context) if index < context.len() => {
                context.remove(index);
                true
            }
            _ => false,
        }
    }

    /// Remove both memories and context for a key
    pub fn clear_session(&self, key: &SessionKey) -> bool {
        let mut sessions = self.sessions.write();
        let had_memories = sessions.memories.remove(key).is_some();
        let had_context = sessions.contexts.remove(key).is_some();
        had_memories || had_context
    }

    /// Clear every session in a conversation, returning the cleared keys
    pub fn clear_conversation(&self, conversation_id: &str) -> Vec<SessionKey> {
        let mut sessions = self.sessions.write();
        let keys: BTreeSet<SessionKey> = sessions
            .memories
            .keys()
            .chain(sessions.contexts.keys())
            .filter(|k| k.conversation_id == conversation_id)
            .cloned()
            .collect();

        for key in &keys {
            sessions.memories.remove(key);
            sessions.contexts.remove(key);
        }
        keys.into_iter().collect()
    }

    /// Keys that currently hold memories
    pub fn memory_keys(&self) -> Vec<SessionKey> {
        let mut keys: Vec<SessionKey> = self.sessions.read().memories.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Keys with memories or context in a conversation, sorted by user
    pub fn keys_in_conversation(&self, conversation_id: &str) -> Vec<SessionKey> {
        let sessions = self.sessions.read();
        let keys: BTreeSet<SessionKey> = sessions
            .memories
            .keys()
            .chain(sessions.contexts.keys())
            .filter(|k| k.conversation_id == conversation_id)
            .cloned()
            .collect();
        keys.into_iter().collect()
    }

    /// (memory count, context line count) for a conversation
    pub fn conversation_counts(&self, conversation_id: &str) -> (usize, usize) {
        let sessions = self.sessions.read();
        let memories = sessions
            .memories
            .iter()
            .filter(|(k, _)| k.conversation_id == conversation_id)
            .map(|(_, m)| m.len())
            .sum();
        let context = sessions
            .contexts
            .iter()
            .filter(|(k, _)| k.conversation_id == conversation_id)
            .map(|(_, c)| c.len())
            .sum();
        (memories, context)
    }

    pub fn stats(&self) -> SessionStats {
        let sessions = self.sessions.read();
        let keys: BTreeSet<&SessionKey> = sessions
            .memories
            .keys()
            .chain(sessions.contexts.keys())
            .collect();
        SessionStats {
            sessions: keys.len(),
            memories: sessions.memories.values().map(Vec::len).sum(),
            context_lines: sessions.contexts.values().map(VecDeque::len).sum(),
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_WINDOW, DEFAULT_MAX_MEMORIES)
    }
}
