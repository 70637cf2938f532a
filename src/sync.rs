//! Memory Persistence Sync
//!
//! Drains the in-memory session store into durable storage:
//! - **Sweep**: every key's memories are upserted on a fixed interval
//! - **Shutdown**: one final best-effort sweep before exit
//! - **Write-through**: interactive adds are persisted immediately with
//!   bounded linear-backoff retry
//!
//! A key that fails to sync is logged and skipped; the sweep always finishes.

use crate::memory::{MemoryRecord, MemoryStorage, StorageError};
use crate::session::{Memory, SessionKey, SessionStore};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Memory and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// SQLite database path (`~` is expanded)
    pub db_path: String,
    /// Interval between sweeps
    pub sync_interval_secs: u64,
    /// Attempts for an interactive write-through
    pub write_retry_attempts: u32,
    /// Base delay between attempts, multiplied by the attempt number
    pub write_retry_backoff_ms: u64,
    /// Context lines kept per session
    pub context_window: usize,
    /// Memory facts kept per session
    pub max_memories_per_session: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        let db_path = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sasi-relay")
            .join("memories.db");

        Self {
            db_path: db_path.to_string_lossy().into_owned(),
            sync_interval_secs: 300,    // 5 minutes
            write_retry_attempts: 3,
            write_retry_backoff_ms: 500, // 0.5s, 1s between attempts
            context_window: crate::session::DEFAULT_CONTEXT_WINDOW,
            max_memories_per_session: crate::session::DEFAULT_MAX_MEMORIES,
        }
    }
}

impl MemoryConfig {
    /// Database path with `~` and env vars expanded
    pub fn resolved_db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::full(&self.db_path).map(|p| p.into_owned()).unwrap_or_else(|_| self.db_path.clone()))
    }
}

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub success_count: usize,
    pub failure_count: usize,
    pub memories_written: usize,
}

/// Cumulative sync statistics
#[derive(Debug, Default)]
pub struct SyncStats {
    pub sweeps: AtomicU64,
    pub keys_synced: AtomicU64,
    pub key_failures: AtomicU64,
    pub write_through_failures: AtomicU64,
}

/// Periodic and write-through persistence of session memories
pub struct MemorySync {
    sessions: Arc<SessionStore>,
    storage: Arc<dyn MemoryStorage>,
    config: MemoryConfig,
    stats: SyncStats,
}

fn to_record(key: &SessionKey, memory: &Memory) -> MemoryRecord {
    MemoryRecord {
        user_id: key.user_id.clone(),
        conversation_id: key.conversation_id.clone(),
        content: memory.content.clone(),
        created_at: memory.created_at.timestamp(),
        last_used: memory.last_used.timestamp(),
        use_count: memory.use_count,
    }
}

impl MemorySync {
    pub fn new(
        sessions: Arc<SessionStore>,
        storage: Arc<dyn MemoryStorage>,
        config: MemoryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            storage,
            config,
            stats: SyncStats::default(),
        })
    }

    pub fn storage(&self) -> &Arc<dyn MemoryStorage> {
        &self.storage
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// Push one key's memories to storage
    pub fn sync_session(&self, key: &SessionKey) -> Result<usize, StorageError> {
        let memories = self.sessions.snapshot_memories(key);
        for memory in &memories {
            self.storage.upsert(&to_record(key, memory))?;
        }
        Ok(memories.len())
    }

    /// Sync every key currently holding memories
    pub fn sweep(&self) -> SyncReport {
        let mut report = SyncReport::default();

        for key in self.sessions.memory_keys() {
            match self.sync_session(&key) {
                Ok(written) => {
                    report.success_count += 1;
                    report.memories_written += written;
                }
                Err(e) => {
                    report.failure_count += 1;
                    warn!("Memory sync failed for {}: {}", key, e);
                }
            }
        }

        self.stats.sweeps.fetch_add(1, Ordering::Relaxed);
        self.stats
            .keys_synced
            .fetch_add(report.success_count as u64, Ordering::Relaxed);
        self.stats
            .key_failures
            .fetch_add(report.failure_count as u64, Ordering::Relaxed);

        debug!(
            "Memory sweep: {} ok, {} failed, {} memories",
            report.success_count, report.failure_count, report.memories_written
        );
        report
    }

    /// Write one memory through to storage, retrying with linear backoff
    pub async fn persist_with_retry(&self, key: &SessionKey, memory: &Memory) -> Result<(), StorageError> {
        let attempts = self.config.write_retry_attempts.max(1);
        let record = to_record(key, memory);
        let mut attempt = 1;

        loop {
            match self.upsert_blocking(&record).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    let delay = Duration::from_millis(self.config.write_retry_backoff_ms * attempt as u64);
                    warn!(
                        "Memory write for {} failed (attempt {}/{}): {}, retrying in {:?}",
                        key, attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.stats.write_through_failures.fetch_add(1, Ordering::Relaxed);
                    error!("Memory write for {} failed after {} attempts: {}", key, attempts, e);
                    return Err(e);
                }
            }
        }
    }

    async fn upsert_blocking(&self, record: &MemoryRecord) -> Result<(), StorageError> {
        let storage = self.storage.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || storage.upsert(&record))
            .await
            .map_err(|e| StorageError::Unavailable(format!("write task failed: {}", e)))?
    }

    /// Store a fact in the session and write it through to storage.
    ///
    /// Returns true when the fact was new for this session.
    pub async fn remember(&self, key: &SessionKey, content: &str) -> Result<bool, StorageError> {
        let content = content.trim();
        let is_new = self.sessions.add_memory(key, content);

        let stored = self
            .sessions
            .snapshot_memories(key)
            .into_iter()
            .find(|m| m.content == content);

        match stored {
            Some(memory) => {
                self.persist_with_retry(key, &memory).await?;
                Ok(is_new)
            }
            None => Ok(false),
        }
    }

    /// Sweep on the configured interval until shutdown, then sweep once more
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> SyncReport {
        let period = Duration::from_secs(self.config.sync_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately
        ticker.tick().await;

        info!("Memory sync running every {:?}", period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.clone().sweep_blocking().await;
                    if report.failure_count > 0 {
                        warn!(
                            "Memory sync: {} sessions synced, {} failed",
                            report.success_count, report.failure_count
                        );
                    } else if report.success_count > 0 {
                        info!("Memory sync: {} sessions synced", report.success_count);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        let report = self.clone().sweep_blocking().await;
        info!(
            "Final memory sync: {} sessions synced, {} failed",
            report.success_count, report.failure_count
        );
        report
    }

    /// Run one sweep on the blocking pool
    pub async fn sweep_blocking(self: Arc<Self>) -> SyncReport {
        match tokio::task::spawn_blocking(move || self.sweep()).await {
            Ok(report) => report,
            Err(e) => {
                error!("Memory sweep task failed: {}", e);
                SyncReport::default()
            }
        }
    }
}
