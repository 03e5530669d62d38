//! Domain Entities - Core business objects
//!
//! These entities represent the compiled form of the gateway configuration,
//! the per-target health record and the inbound request as the core sees it.

use crate::domain::value_objects::{HealthState, PathPattern, Protocol, StatusRange, WafMode};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;

/// A bound (port, protocol) endpoint accepting inbound connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Certificate identifier, HTTPS only
    pub certificate: Option<String>,
    pub host_name: Option<String>,
}

/// Where a matching rule sends the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
    Backend { pool: String, settings: String },
    Redirect { listener: String },
}

/// Priority-ordered path-match-to-target mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    pub name: String,
    pub listener: String,
    /// Lower is evaluated first
    pub priority: u32,
    pub path: PathPattern,
    pub target: RuleTarget,
}

/// Static address list. Health is layered on top in the backend state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendPool {
    pub name: String,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSettings {
    pub name: String,
    pub protocol: Protocol,
    pub port: u16,
    pub request_timeout: Duration,
    pub cookie_affinity: bool,
    pub host_header: Option<String>,
    pub probe: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbe {
    pub name: String,
    pub protocol: Protocol,
    pub path: String,
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive like outcomes needed to flip between Healthy and Unhealthy
    pub unhealthy_threshold: u32,
    pub status_range: StatusRange,
}

/// Process-wide firewall policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WafPolicy {
    pub mode: WafMode,
    pub rule_set_version: String,
    pub max_request_body_bytes: usize,
    pub file_upload_limit_bytes: usize,
    pub inspect_body: bool,
}

/// Certificate declared in configuration. Material is never stored here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRef {
    pub id: String,
    pub material_ref: String,
    pub renewal_lead_time: chrono::Duration,
}

/// Validity window of a certificate as reported by the secret provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateMetadata {
    pub id: String,
    pub material_ref: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl CertificateMetadata {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }

    pub fn is_not_yet_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.not_before
    }

    /// Renewal is due once `now >= not_after - lead`.
    pub fn renewal_due(&self, now: DateTime<Utc>, lead: chrono::Duration) -> bool {
        now >= self.not_after - lead
    }
}

/// A probing assignment: one pool monitored with one probe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HealthBinding {
    pub pool: String,
    pub probe: String,
    pub port: u16,
    pub protocol: Protocol,
    pub host_header: Option<String>,
}

/// The (target, settings) tuple handed to the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardPlan {
    pub listener: String,
    pub rule: String,
    pub pool: String,
    pub target: String,
    pub settings: BackendSettings,
}

impl ForwardPlan {
    /// Upstream authority, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.target.contains(':') {
            format!("[{}]:{}", self.target, self.settings.port)
        } else {
            format!("{}:{}", self.target, self.settings.port)
        }
    }

    /// Host header sent upstream.
    pub fn host_header(&self) -> String {
        self.settings
            .host_header
            .clone()
            .unwrap_or_else(|| self.target.clone())
    }
}

/// Result of a single probe against a single target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success { status: Option<u16>, latency_ms: u64 },
    Failure { reason: String, latency_ms: u64 },
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success { .. })
    }
}

/// Health record of one (pool, target) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetHealth {
    pub status: HealthState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_probe: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl Default for TargetHealth {
    fn default() -> Self {
        Self {
            status: HealthState::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_probe: None,
            latency_ms: None,
            last_error: None,
        }
    }
}

impl TargetHealth {
    /// Apply a probe outcome and return `(old, new)` if the status changed.
    ///
    /// The first completed probe decides Unknown. Afterwards the status only
    /// flips after `threshold` consecutive outcomes of the opposite kind.
    pub fn record(
        &mut self,
        outcome: &ProbeOutcome,
        threshold: u32,
        at: DateTime<Utc>,
    ) -> Option<(HealthState, HealthState)> {
        let threshold = threshold.max(1);
        let old = self.status;

        match outcome {
            ProbeOutcome::Success { latency_ms, .. } => {
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                self.consecutive_failures = 0;
                self.latency_ms = Some(*latency_ms);
                self.last_error = None;

                self.status = match old {
                    HealthState::Unknown => HealthState::Healthy,
                    HealthState::Unhealthy if self.consecutive_successes >= threshold => {
                        HealthState::Healthy
                    }
                    other => other,
                };
            }
            ProbeOutcome::Failure { reason, latency_ms } => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.consecutive_successes = 0;
                self.latency_ms = Some(*latency_ms);
                self.last_error = Some(reason.clone());

                self.status = match old {
                    HealthState::Unknown => HealthState::Unhealthy,
                    HealthState::Healthy if self.consecutive_failures >= threshold => {
                        HealthState::Unhealthy
                    }
                    other => other,
                };
            }
        }

        self.last_probe = Some(at);

        if old != self.status {
            Some((old, self.status))
        } else {
            None
        }
    }
}

/// An inbound request, reduced to the attributes the gateway consumes.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub id: String,
    /// Port of the listener that accepted the connection
    pub port: u16,
    pub protocol: Protocol,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub host: Option<String>,
    /// Header names are stored lowercase
    pub headers: Vec<(String, String)>,
    /// Body bytes available for inspection
    pub body: Bytes,
    /// Declared or observed body length, may exceed `body.len()`
    pub body_len: usize,
    pub client_addr: Option<SocketAddr>,
}

impl GatewayRequest {
    pub fn new(port: u16, protocol: Protocol, method: &str, path_and_query: &str) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path_and_query.to_string(), None),
        };

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            port,
            protocol,
            method: method.to_uppercase(),
            path,
            query,
            host: None,
            headers: Vec::new(),
            body: Bytes::new(),
            body_len: 0,
            client_addr: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_lowercase(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.body_len = self.body.len();
        self
    }

    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Value of a cookie from the `Cookie` header(s).
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n == "cookie")
            .flat_map(|(_, v)| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    /// Path plus query string as received.
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }
}
