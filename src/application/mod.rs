//! Application Layer
//!
//! Use cases composed from domain services and ports.

mod dispatcher;
mod gateway_service;

pub use dispatcher::{DispatchOutcome, Dispatcher, PendingDecision};
pub use gateway_service::{GatewayResponse, GatewayService, AFFINITY_COOKIE};
