//! Process-wide slot registry (spec §4.J).
//!
//! Grounded on `src/event_sink/sink.rs`'s `SinkRegistry` for the
//! name-keyed `HashMap` plus drain-on-clear shape, generalized to key on
//! connection identity instead of sink name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::info;

/// `(host, port, database, compatibility_mode)` (spec §3 "Slot cache key").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub compatibility_mode: String,
}

/// Placeholder for whatever the embedder's DataSource type is; the
/// registry itself is agnostic to its contents beyond eviction/draining.
pub trait DataSource: Send + Sync {
    /// Begins an orderly drain; the registry does not wait on it.
    fn begin_drain(&self);
}

/// A process-wide map from connection identity to cached `DataSource`.
/// Create one per embedder; the Non-goals rule out an implicit global
/// (spec §9: "expose a Registry handle created by the embedder").
pub struct Registry {
    entries: RwLock<HashMap<ConnectionKey, Arc<dyn DataSource>>>,
    drain_grace: Duration,
}

impl Registry {
    pub fn new(drain_grace: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            drain_grace,
        }
    }

    pub async fn get_or_insert_with<F>(&self, key: ConnectionKey, create: F) -> Arc<dyn DataSource>
    where
        F: FnOnce() -> Arc<dyn DataSource>,
    {
        if let Some(existing) = self.entries.read().await.get(&key) {
            return existing.clone();
        }
        let mut guard = self.entries.write().await;
        guard.entry(key).or_insert_with(create).clone()
    }

    /// Evicts one entry and begins its drain phase.
    pub async fn clear(&self, key: &ConnectionKey) {
        let removed = self.entries.write().await.remove(key);
        if let Some(source) = removed {
            info!(grace_secs = self.drain_grace.as_secs(), "draining replication slot entry");
            source.begin_drain();
        }
    }

    /// Evicts and drains every entry. Process-exit hooks must call this to
    /// minimize server-side warnings about dangling replication slots.
    pub async fn clear_all(&self) {
        let mut guard = self.entries.write().await;
        let drained: Vec<_> = guard.drain().collect();
        drop(guard);
        for (_, source) in drained {
            source.begin_drain();
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
