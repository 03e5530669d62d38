//! Domain Services
//!
//! Stateless or self-contained logic with no I/O.

mod routing_compiler;
mod routing_table;
mod target_selector;
pub mod waf;

pub use routing_compiler::RoutingCompiler;
pub use routing_table::{RoutingTable, TableHandle};
pub use target_selector::RoundRobinSelector;
pub use waf::{WafFilter, WafModeSwitch, WafVerdict};
