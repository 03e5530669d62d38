//! Adapters Layer
//!
//! Inbound adapters drive the application (HTTP listeners, admin API),
//! outbound adapters implement the domain ports.

pub mod inbound;
pub mod outbound;
