//! Affinity Store Port
//!
//! Session-to-target bindings for cookie affinity.

use async_trait::async_trait;
use std::time::{Duration, Instant};

/// Target a session is pinned to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityBinding {
    pub pool: String,
    pub target: String,
    pub created_at: Instant,
    pub last_seen: Instant,
}

impl AffinityBinding {
    pub fn new(pool: impl Into<String>, target: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            pool: pool.into(),
            target: target.into(),
            created_at: now,
            last_seen: now,
        }
    }
}

/// Repository for session bindings, keyed by the affinity cookie value.
#[async_trait]
pub trait AffinityStore: Send + Sync {
    async fn get(&self, session: &str) -> Option<AffinityBinding>;

    async fn set(&self, session: String, binding: AffinityBinding);

    async fn remove(&self, session: &str);

    /// Refresh `last_seen` for an existing binding.
    async fn touch(&self, session: &str);

    /// Remove bindings not seen within the TTL.
    async fn cleanup_expired(&self, ttl: Duration) -> usize;

    async fn count(&self) -> usize;
}
