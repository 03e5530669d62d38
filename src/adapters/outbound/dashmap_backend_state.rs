//! DashMap Backend State
//!
//! Shared health records keyed by (pool, target). Written by the health
//! monitor, read by the dispatcher through `BackendStateReader`.

use crate::domain::entities::{ProbeOutcome, TargetHealth};
use crate::domain::ports::BackendStateReader;
use crate::domain::value_objects::{HealthState, TargetKey};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// DashMap-backed backend state.
///
/// Each entry is updated under its shard lock only, so a probe result
/// never blocks reads of unrelated targets.
pub struct DashMapBackendState {
    entries: DashMap<TargetKey, TargetHealth>,
    created_at: Instant,
}

impl DashMapBackendState {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            created_at: Instant::now(),
        }
    }

    /// Start tracking a target as Unknown if it is not tracked yet.
    pub fn track(&self, key: TargetKey) {
        self.entries.entry(key).or_default();
    }

    /// Apply a probe outcome. Returns `(old, new)` when the status flipped.
    ///
    /// Only tracked targets are updated. A result arriving after its target
    /// was dropped is discarded.
    pub fn record(
        &self,
        key: &TargetKey,
        outcome: &ProbeOutcome,
        threshold: u32,
        at: DateTime<Utc>,
    ) -> Option<(HealthState, HealthState)> {
        let Some(mut entry) = self.entries.get_mut(key) else {
            tracing::debug!("discarding probe result of untracked target {}", key);
            return None;
        };
        entry.record(outcome, threshold, at)
    }

    /// Drop every target for which `keep` returns false.
    pub fn retain<F>(&self, keep: F) -> usize
    where
        F: Fn(&TargetKey) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|key, _| keep(key));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DashMapBackendState {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendStateReader for DashMapBackendState {
    fn status(&self, key: &TargetKey) -> HealthState {
        self.entries
            .get(key)
            .map(|e| e.status)
            .unwrap_or(HealthState::Unknown)
    }

    fn health(&self, key: &TargetKey) -> Option<TargetHealth> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    fn snapshot(&self) -> Vec<(TargetKey, TargetHealth)> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| (&a.0.pool, &a.0.target).cmp(&(&b.0.pool, &b.0.target)));
        all
    }

    fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}
