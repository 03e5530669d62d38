//! Domain Layer
//!
//! Pure gateway logic: configuration model, compiled routing table,
//! health state machine, WAF and the ports to external collaborators.

pub mod entities;
pub mod errors;
pub mod events;
pub mod gateway_config;
pub mod ports;
pub mod services;
pub mod value_objects;
