//! Deduplication Guard
//!
//! Records inbound message IDs so a redelivered event is handled at most once.
//! Retention is explicit: either an unbounded set for the process lifetime, or
//! a moka cache bounded by entry count and time-to-live.

use moka::future::Cache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Retention settings for seen message IDs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Keep every ID for the process lifetime
    pub unbounded: bool,
    /// Maximum IDs retained when bounded
    pub max_entries: u64,
    /// How long an ID is remembered when bounded
    pub ttl_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            unbounded: false,
            max_entries: 100_000, // ~a day of busy groups
            ttl_secs: 86_400,     // 24 hours
        }
    }
}

enum SeenIds {
    Unbounded(RwLock<HashSet<String>>),
    Bounded(Cache<String, ()>),
}

/// Dedup statistics
#[derive(Debug, Clone)]
pub struct DedupStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub tracked: u64,
}

/// At-most-once guard over inbound message IDs
pub struct DedupGuard {
    seen: SeenIds,
    accepted: AtomicU64,
    duplicates: AtomicU64,
}

impl DedupGuard {
    pub fn new(config: &DedupConfig) -> Self {
        let seen = if config.unbounded {
            SeenIds::Unbounded(RwLock::new(HashSet::new()))
        } else {
            SeenIds::Bounded(
                Cache::builder()
                    .max_capacity(config.max_entries)
                    .time_to_live(Duration::from_secs(config.ttl_secs))
                    .build(),
            )
        };

        Self {
            seen,
            accepted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    /// Guard that never forgets an ID
    pub fn unbounded() -> Self {
        Self::new(&DedupConfig {
            unbounded: true,
            ..Default::default()
        })
    }

    /// Record `message_id`, returning true only on its first sighting.
    ///
    /// Empty IDs cannot be keyed and are always treated as new.
    pub async fn mark_if_new(&self, message_id: &str) -> bool {
        if message_id.is_empty() {
            return true;
        }

        let fresh = match &self.seen {
            SeenIds::Unbounded(set) => set.write().insert(message_id.to_string()),
            SeenIds::Bounded(cache) => cache
                .entry(message_id.to_string())
                .or_insert(())
                .await
                .is_fresh(),
        };

        if fresh {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!("Duplicate message {} ignored", message_id);
        }
        fresh
    }

    pub fn stats(&self) -> DedupStats {
        let tracked = match &self.seen {
            SeenIds::Unbounded(set) => set.read().len() as u64,
            SeenIds::Bounded(cache) => cache.entry_count(),
        };
        DedupStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            tracked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_first_sighting_only() {
        for guard in [DedupGuard::unbounded(), DedupGuard::new(&DedupConfig::default())] {
            assert!(guard.mark_if_new("A1").await);
            assert!(!guard.mark_if_new("A1").await);
            assert!(!guard.mark_if_new("A1").await);
            assert!(guard.mark_if_new("A2").await);

            let stats = guard.stats();
            assert_eq!(stats.accepted, 2);
            assert_eq!(stats.duplicates, 2);
        }
    }

    #[test]
    fn test_empty_id_always_new() {
        let guard = DedupGuard::unbounded();
        assert!(tokio_test::block_on(guard.mark_if_new("")));
        assert!(tokio_test::block_on(guard.mark_if_new("")));
        assert_eq!(guard.stats().tracked, 0);
    }

    #[tokio::test]
    async fn test_concurrent_delivery_accepts_once() {
        for guard in [DedupGuard::unbounded(), DedupGuard::new(&DedupConfig::default())] {
            let guard = Arc::new(guard);
            let mut handles = Vec::new();
            for _ in 0..32 {
                let guard = guard.clone();
                handles.push(tokio::spawn(async move { guard.mark_if_new("RACE").await }));
            }

            let mut accepted = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    accepted += 1;
                }
            }
            assert_eq!(accepted, 1, "Exactly one concurrent delivery should win");
        }
    }

    #[tokio::test]
    async fn test_bounded_guard_forgets_after_ttl() {
        let guard = DedupGuard::new(&DedupConfig {
            unbounded: false,
            max_entries: 10,
            ttl_secs: 1,
        });
        assert!(guard.mark_if_new("T1").await);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(guard.mark_if_new("T1").await, "Expired IDs are admitted again");
    }
}
