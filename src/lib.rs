//! edge-gateway Library
//!
//! Exposes the gateway components for use in integration tests and as a
//! library.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{Dispatcher, GatewayService};
pub use config::load_config;
pub use domain::entities::{GatewayRequest, TargetHealth};
pub use domain::gateway_config::GatewayConfig;
pub use domain::ports::{
    AffinityStore, BackendStateReader, EventSink, Forwarder, Prober, SecretProvider,
    TableObserver,
};
pub use domain::services::{RoutingCompiler, RoutingTable};
pub use domain::value_objects::{HealthState, Protocol, WafMode};
pub use infrastructure::{CertificateManager, HealthMonitor};
