//! Tracing Event Sink
//!
//! Default observability collaborator: every gateway event becomes one
//! structured `tracing` record on the `edge_gateway::events` target.

use crate::domain::events::{AlertSeverity, GatewayEvent};
use crate::domain::ports::EventSink;

pub const EVENT_TARGET: &str = "edge_gateway::events";

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl TracingEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for TracingEventSink {
    fn emit(&self, event: GatewayEvent) {
        let name = event.name();
        let payload = serde_json::to_string(&event).unwrap_or_else(|e| {
            format!("{{\"event\":\"{}\",\"serialization_error\":\"{}\"}}", name, e)
        });

        match &event {
            GatewayEvent::CertificateAlert {
                severity: AlertSeverity::Critical,
                ..
            } => tracing::error!(target: EVENT_TARGET, event = name, "{}", payload),
            GatewayEvent::CertificateAlert { .. } | GatewayEvent::ConfigurationRejected { .. } => {
                tracing::warn!(target: EVENT_TARGET, event = name, "{}", payload)
            }
            GatewayEvent::RoutingDecision { .. } => {
                tracing::debug!(target: EVENT_TARGET, event = name, "{}", payload)
            }
            _ => tracing::info!(target: EVENT_TARGET, event = name, "{}", payload),
        }
    }
}
