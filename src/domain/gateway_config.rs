//! Gateway Configuration Document
//!
//! The declarative document consumed by the routing table compiler.
//! It mirrors what the external configuration collaborator hands us:
//! listeners, rules, pools, settings, probes, WAF policy and certificate
//! references. Nothing here is validated; that is the compiler's job.

use crate::domain::errors::ConfigError;
use crate::domain::value_objects::{Protocol, StatusRange, WafMode};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub settings: Vec<SettingsConfig>,
    #[serde(default)]
    pub probes: Vec<ProbeConfig>,
    #[serde(default)]
    pub waf: WafPolicyConfig,
    #[serde(default)]
    pub certificates: Vec<CertificateConfig>,
}

impl GatewayConfig {
    /// Parse a JSON document.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Read and parse a JSON document from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json(&raw)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub certificate: Option<String>,
    /// Public host name used when building redirect locations
    #[serde(default)]
    pub host_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub listener: String,
    pub priority: u32,
    pub path: String,
    pub target: RuleTargetConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTargetConfig {
    Backend { pool: String, settings: String },
    Redirect { listener: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsConfig {
    pub name: String,
    #[serde(default = "default_backend_protocol")]
    pub protocol: Protocol,
    pub port: u16,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub cookie_affinity: bool,
    #[serde(default)]
    pub host_header: Option<String>,
    pub probe: String,
}

fn default_backend_protocol() -> Protocol {
    Protocol::Http
}
fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub name: String,
    #[serde(default = "default_backend_protocol")]
    pub protocol: Protocol,
    pub path: String,
    #[serde(default = "default_probe_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default)]
    pub status_range: StatusRange,
}

fn default_probe_interval_secs() -> u64 {
    30
}
fn default_probe_timeout_secs() -> u64 {
    30
}
fn default_unhealthy_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WafPolicyConfig {
    #[serde(default = "default_waf_mode")]
    pub mode: WafMode,
    #[serde(default = "default_rule_set_version")]
    pub rule_set_version: String,
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,
    #[serde(default = "default_file_upload_limit_bytes")]
    pub file_upload_limit_bytes: usize,
    #[serde(default = "default_inspect_body")]
    pub inspect_body: bool,
}

fn default_waf_mode() -> WafMode {
    WafMode::Detection
}
fn default_rule_set_version() -> String {
    "3.2".to_string()
}
fn default_max_request_body_bytes() -> usize {
    128 * 1024
}
fn default_file_upload_limit_bytes() -> usize {
    100 * 1024 * 1024
}
fn default_inspect_body() -> bool {
    true
}

impl Default for WafPolicyConfig {
    fn default() -> Self {
        Self {
            mode: default_waf_mode(),
            rule_set_version: default_rule_set_version(),
            max_request_body_bytes: default_max_request_body_bytes(),
            file_upload_limit_bytes: default_file_upload_limit_bytes(),
            inspect_body: default_inspect_body(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateConfig {
    pub id: String,
    /// Opaque reference resolved lazily by the secret provider
    pub material_ref: String,
    #[serde(default = "default_renewal_lead_days")]
    pub renewal_lead_days: u32,
}

fn default_renewal_lead_days() -> u32 {
    30
}
