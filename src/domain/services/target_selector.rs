//! Target Selector
//!
//! Deterministic round-robin over the eligible targets of a pool.
//! Each pool has its own cursor so traffic on one rule never skews
//! the rotation of another.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    cursors: DashMap<String, AtomicUsize>,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the next target among `eligible`, `None` if it is empty.
    ///
    /// The cursor advances once per call, so with a stable eligible list
    /// consecutive calls cycle through it in order.
    pub fn select<'a>(&self, pool: &str, eligible: &[&'a str]) -> Option<&'a str> {
        if eligible.is_empty() {
            return None;
        }

        let n = match self.cursors.get(pool) {
            Some(cursor) => cursor.fetch_add(1, Ordering::Relaxed),
            None => self
                .cursors
                .entry(pool.to_string())
                .or_insert_with(|| AtomicUsize::new(0))
                .fetch_add(1, Ordering::Relaxed),
        };

        Some(eligible[n % eligible.len()])
    }

    /// Drop cursors of pools that no longer exist.
    pub fn retain_pools<F>(&self, keep: F)
    where
        F: Fn(&str) -> bool,
    {
        self.cursors.retain(|pool, _| keep(pool));
    }

    pub fn pool_count(&self) -> usize {
        self.cursors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_cycles_in_order() {
        let selector = RoundRobinSelector::new();
        let targets = ["a", "b", "c"];
        let picked: Vec<_> = (0..6)
            .map(|_| selector.select("pool", &targets).unwrap())
            .collect();
        assert_eq!(picked, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_single_target_always_selected() {
        let selector = RoundRobinSelector::new();
        for _ in 0..10 {
            assert_eq!(selector.select("recommend-pool", &["A"]), Some("A"));
        }
    }

    #[test]
    fn test_empty_eligible_list() {
        let selector = RoundRobinSelector::new();
        assert_eq!(selector.select("pool", &[]), None);
        assert_eq!(selector.pool_count(), 0);
    }

    #[test]
    fn test_cursors_are_per_pool() {
        let selector = RoundRobinSelector::new();
        assert_eq!(selector.select("p1", &["a", "b"]), Some("a"));
        assert_eq!(selector.select("p2", &["x", "y"]), Some("x"));
        assert_eq!(selector.select("p1", &["a", "b"]), Some("b"));
    }

    #[test]
    fn test_retain_pools() {
        let selector = RoundRobinSelector::new();
        selector.select("keep", &["a"]);
        selector.select("drop", &["a"]);
        selector.retain_pools(|p| p == "keep");
        assert_eq!(selector.pool_count(), 1);
    }
}
