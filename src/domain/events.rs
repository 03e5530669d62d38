//! Structured events emitted to the observability collaborator.

use crate::domain::value_objects::{HealthState, WafMode};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingOutcome {
    Forwarded,
    Redirected,
    Blocked,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WafAction {
    /// Detection mode: recorded, request continues
    Logged,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    RoutingDecision {
        request_id: String,
        listener: Option<String>,
        rule: Option<String>,
        pool: Option<String>,
        backend: Option<String>,
        outcome: RoutingOutcome,
        reason: Option<String>,
        latency_us: u64,
    },
    HealthTransition {
        pool: String,
        target: String,
        old: HealthState,
        new: HealthState,
        at: DateTime<Utc>,
    },
    WafMatch {
        request_id: String,
        rule_id: String,
        mode: WafMode,
        action: WafAction,
    },
    CertificateRenewed {
        listener: String,
        certificate: String,
        old_expiry: DateTime<Utc>,
        new_expiry: DateTime<Utc>,
    },
    CertificateAlert {
        listener: String,
        certificate: String,
        severity: AlertSeverity,
        reason: String,
        not_after: Option<DateTime<Utc>>,
    },
    ConfigurationRejected {
        violations: Vec<String>,
    },
}

impl GatewayEvent {
    /// Event name as serialized in the `event` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoutingDecision { .. } => "routing_decision",
            Self::HealthTransition { .. } => "health_transition",
            Self::WafMatch { .. } => "waf_match",
            Self::CertificateRenewed { .. } => "certificate_renewed",
            Self::CertificateAlert { .. } => "certificate_alert",
            Self::ConfigurationRejected { .. } => "configuration_rejected",
        }
    }
}
