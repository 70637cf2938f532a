//! Sasi Relay
//!
//! WhatsApp group bot relay: admits inbound group messages, classifies them
//! into intents and hands each to a response pipeline, while keeping
//! per-user session memory that is persisted to SQLite.
//!
//! # Architecture
//!
//! ```text
//! Bridge ──► POST /events ──► RelayEngine ──► IntentRouter
//!                                 │               │
//!                                 │               ├── Chat (Ollama)
//!                                 │               ├── Image analysis (vision model)
//!                                 │               ├── Image generation / ComfyUI edit
//!                                 │               └── Family / Food / Web webhooks
//!                                 │
//!                                 ├── DedupGuard (Moka)
//!                                 ├── ConversationRegistry
//!                                 ├── SessionStore ──► MemorySync ──► SQLite
//!                                 └── OutboundDispatcher ──► Bridge
//! ```

pub mod admin;
pub mod channels;
pub mod config;
pub mod conversation;
pub mod dedup;
pub mod dispatcher;
pub mod engine;
pub mod formatter;
pub mod memory;
pub mod pipelines;
pub mod reply;
pub mod router;
pub mod server;
pub mod session;
pub mod sync;

#[cfg(test)]
mod testing;

pub use admin::{Admin, AdminError};
pub use config::{BotConfig, Config};
pub use conversation::{Conversation, ConversationRegistry, ConversationSummary};
pub use dedup::{DedupConfig, DedupGuard};
pub use dispatcher::OutboundDispatcher;
pub use engine::{EngineStats, Models, Rejection, RelayEngine};
pub use formatter::format_message;
pub use memory::{MemoryRecord, MemoryStorage, SqliteMemoryStore, StorageError, StoredMemory};
pub use pipelines::{Pipeline, PipelineError};
pub use router::{DropReason, Intent, IntentRouter, Route};
pub use server::{RelayServer, ServerConfig};
pub use session::{Memory, SessionKey, SessionStore};
pub use sync::{MemoryConfig, MemorySync, SyncReport};
