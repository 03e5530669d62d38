//! Backend State Port
//!
//! Read-only view of the health state published by the health monitor.

use crate::domain::entities::TargetHealth;
use crate::domain::value_objects::{HealthState, TargetKey};
use std::time::Duration;

/// Read access to the shared backend state.
///
/// The dispatcher only ever reads through this interface. The single writer
/// per target is the probing loop of that target's pool.
pub trait BackendStateReader: Send + Sync {
    /// Current status of a target. Targets never probed are `Unknown`.
    fn status(&self, key: &TargetKey) -> HealthState;

    /// Full health record of a target, if tracked.
    fn health(&self, key: &TargetKey) -> Option<TargetHealth>;

    /// Consistent copy of every tracked target.
    fn snapshot(&self) -> Vec<(TargetKey, TargetHealth)>;

    /// Time elapsed since the state was created (boot grace window).
    fn age(&self) -> Duration;
}
