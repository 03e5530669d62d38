//! DashMap Affinity Store
//!
//! Implements AffinityStore using DashMap for lock-free concurrent access.

use crate::domain::ports::{AffinityBinding, AffinityStore};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// DashMap-backed affinity store with periodic garbage collection.
pub struct DashMapAffinityStore {
    bindings: Arc<DashMap<String, AffinityBinding>>,
}

impl DashMapAffinityStore {
    pub fn new() -> Self {
        Self {
            bindings: Arc::new(DashMap::new()),
        }
    }

    /// Start the background garbage collection task.
    ///
    /// Removes sessions that have not been seen within the TTL.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start_gc(&self, ttl: Duration, interval: Duration) {
        let bindings = self.bindings.clone();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let removed = remove_expired(&bindings, ttl);
                if removed > 0 {
                    tracing::debug!("affinity GC removed {} expired sessions", removed);
                }
            }
        });
    }
}

impl Default for DashMapAffinityStore {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_expired(bindings: &DashMap<String, AffinityBinding>, ttl: Duration) -> usize {
    let now = Instant::now();
    let before = bindings.len();
    bindings.retain(|_, b| now.duration_since(b.last_seen) <= ttl);
    before.saturating_sub(bindings.len())
}

#[async_trait]
impl AffinityStore for DashMapAffinityStore {
    async fn get(&self, session: &str) -> Option<AffinityBinding> {
        self.bindings.get(session).map(|e| e.value().clone())
    }

    async fn set(&self, session: String, binding: AffinityBinding) {
        self.bindings.insert(session, binding);
    }

    async fn remove(&self, session: &str) {
        self.bindings.remove(session);
    }

    async fn touch(&self, session: &str) {
        if let Some(mut entry) = self.bindings.get_mut(session) {
            entry.last_seen = Instant::now();
        }
    }

    async fn cleanup_expired(&self, ttl: Duration) -> usize {
        remove_expired(&self.bindings, ttl)
    }

    async fn count(&self) -> usize {
        self.bindings.len()
    }
}
