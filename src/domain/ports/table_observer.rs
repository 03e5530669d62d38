//! Table Observer Port
//!
//! Components whose runtime state derives from the routing table (probing
//! loops, certificate bindings) are notified after every successful swap.

use crate::domain::services::RoutingTable;
use std::sync::Arc;

pub trait TableObserver: Send + Sync {
    /// Called once per activated table. Must not block.
    fn table_changed(&self, table: Arc<RoutingTable>);
}
