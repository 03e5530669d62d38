//! Domain Errors
//!
//! Error taxonomy of the gateway. Configuration errors are fatal to
//! activation, routing errors are per-request, probe and certificate
//! problems are recorded and retried on the next cycle.

use crate::domain::value_objects::Protocol;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// A single problem found while compiling a configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigViolation {
    #[error("duplicate {kind} name '{name}'")]
    DuplicateName { kind: &'static str, name: String },

    #[error("listeners '{first}' and '{second}' both bind {protocol} port {port}")]
    DuplicateListenerBinding {
        first: String,
        second: String,
        port: u16,
        protocol: Protocol,
    },

    #[error("https listener '{listener}' has no certificate")]
    MissingCertificate { listener: String },

    #[error("listener '{listener}' references unknown certificate '{certificate}'")]
    UnknownCertificate {
        listener: String,
        certificate: String,
    },

    #[error("rule '{rule}' references unknown listener '{listener}'")]
    UnknownListener { rule: String, listener: String },

    #[error("rule '{rule}' references unknown backend pool '{pool}'")]
    UnknownPool { rule: String, pool: String },

    #[error("rule '{rule}' references unknown backend settings '{settings}'")]
    UnknownSettings { rule: String, settings: String },

    #[error("rule '{rule}' redirects to unknown listener '{listener}'")]
    UnknownRedirectListener { rule: String, listener: String },

    #[error("rule '{rule}' redirects to its own listener '{listener}'")]
    RedirectLoop { rule: String, listener: String },

    #[error("backend settings '{settings}' reference unknown probe '{probe}'")]
    UnknownProbe { settings: String, probe: String },

    #[error("rules '{first}' and '{second}' share priority {priority} on listener '{listener}'")]
    DuplicatePriority {
        listener: String,
        first: String,
        second: String,
        priority: u32,
    },

    #[error("listener '{listener}' has no default '/*' rule")]
    MissingDefaultRule { listener: String },

    #[error("listener '{listener}' has {count} default '/*' rules, expected exactly one")]
    MultipleDefaultRules { listener: String, count: usize },

    #[error("rule '{rule}': {reason}")]
    InvalidPathPattern { rule: String, reason: String },

    #[error("backend pool '{pool}' has no targets")]
    EmptyPool { pool: String },

    #[error("probe '{probe}': {reason}")]
    InvalidProbe { probe: String, reason: String },

    #[error("backend settings '{settings}': {reason}")]
    InvalidSettings { settings: String, reason: String },

    #[error("backend pool '{pool}' is monitored through conflicting settings '{first}' and '{second}'")]
    ConflictingHealthBinding {
        pool: String,
        first: String,
        second: String,
    },

    #[error("unsupported WAF rule set version '{version}'")]
    UnsupportedRuleSet { version: String },

    #[error("WAF policy: {reason}")]
    InvalidWafPolicy { reason: String },
}

/// Errors raised while loading or compiling configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path}: {message}")]
    Io { path: String, message: String },

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("configuration rejected with {} violation(s): {}", .0.len(), join_violations(.0))]
    Invalid(Vec<ConfigViolation>),
}

impl ConfigError {
    /// All violations, empty for I/O and parse errors.
    pub fn violations(&self) -> &[ConfigViolation] {
        match self {
            Self::Invalid(v) => v,
            _ => &[],
        }
    }
}

fn join_violations(violations: &[ConfigViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Per-request routing failures. Surfaced to clients as 5xx.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// The connection should never have been accepted.
    #[error("no listener bound to {protocol} port {port}")]
    NoListenerMatch { port: u16, protocol: Protocol },

    #[error("no rule on listener '{listener}' matches path '{path}'")]
    NoRouteMatch { listener: String, path: String },

    #[error("no healthy backend in pool '{pool}'")]
    NoHealthyBackend { pool: String },

    #[error("routing table references missing {kind} '{name}'")]
    Inconsistent { kind: &'static str, name: String },
}

impl RoutingError {
    /// HTTP status code reported to the client.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NoListenerMatch { .. } | Self::Inconsistent { .. } => 500,
            Self::NoRouteMatch { .. } => 502,
            Self::NoHealthyBackend { .. } => 503,
        }
    }

    /// Short machine-readable reason for routing-decision events.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoListenerMatch { .. } => "no_listener_match",
            Self::NoRouteMatch { .. } => "no_route_match",
            Self::NoHealthyBackend { .. } => "no_healthy_backend",
            Self::Inconsistent { .. } => "inconsistent_table",
        }
    }
}

/// Failures of the external secret collaborator.
#[derive(Debug, Clone, Error)]
pub enum SecretError {
    #[error("certificate '{0}' not found")]
    NotFound(String),

    #[error("secret provider unavailable: {0}")]
    Unavailable(String),

    #[error("invalid certificate material for '{id}': {reason}")]
    InvalidMaterial { id: String, reason: String },
}

/// Certificate lifecycle failures of the listener manager.
#[derive(Debug, Clone, Error)]
pub enum CertificateError {
    #[error("certificate '{id}' for listener '{listener}' expired at {not_after}")]
    Expired {
        listener: String,
        id: String,
        not_after: DateTime<Utc>,
    },

    #[error("renewal of certificate '{id}' for listener '{listener}' failed: {reason}")]
    RenewalFailed {
        listener: String,
        id: String,
        reason: String,
    },

    #[error("listener '{0}' has no certificate binding")]
    UnknownListener(String),

    #[error(transparent)]
    Secret(#[from] SecretError),
}
