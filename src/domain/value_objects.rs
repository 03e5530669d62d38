//! Value Objects - Immutable domain primitives
//!
//! Value objects are identified by their value rather than identity.
//! They are immutable and can be freely shared.

use serde::{Deserialize, Serialize};

/// Frontend protocol of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    /// URL scheme for this protocol.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    /// Port that can be omitted from URLs using this scheme.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.scheme())
    }
}

/// Health of a single backend target as seen by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// No probe has completed yet
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Firewall enforcement mode.
///
/// Detection evaluates and records matches without blocking.
/// Prevention blocks the request on the first match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WafMode {
    Detection,
    Prevention,
}

impl WafMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detection => "detection",
            Self::Prevention => "prevention",
        }
    }

    /// Parse a mode name, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "detection" => Some(Self::Detection),
            "prevention" => Some(Self::Prevention),
            _ => None,
        }
    }
}

impl std::fmt::Display for WafMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Path pattern of a routing rule.
///
/// Either an exact path (`/api/health`) or a prefix followed by a single
/// trailing wildcard (`/api/*`). `/*` is the catch-all.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathPattern {
    Exact(String),
    Prefix(String),
}

impl PathPattern {
    /// Parse a pattern string.
    ///
    /// Returns the reason on failure so the compiler can report it.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if !raw.starts_with('/') {
            return Err(format!("path pattern '{}' must start with '/'", raw));
        }

        match raw.find('*') {
            None => Ok(Self::Exact(raw.to_string())),
            Some(idx) if idx == raw.len() - 1 => Ok(Self::Prefix(raw[..idx].to_string())),
            Some(_) => Err(format!(
                "path pattern '{}' may only contain a single trailing '*'",
                raw
            )),
        }
    }

    /// Whether this pattern matches every path.
    pub fn is_catch_all(&self) -> bool {
        matches!(self, Self::Prefix(p) if p == "/")
    }

    /// Match a request path against this pattern.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(p) => p == path,
            Self::Prefix(prefix) => {
                if path.starts_with(prefix.as_str()) {
                    return true;
                }
                // `/api/*` also covers `/api`
                prefix.len() > 1
                    && prefix.ends_with('/')
                    && path == &prefix[..prefix.len() - 1]
            }
        }
    }

    /// Render back to the configured form.
    pub fn as_pattern(&self) -> String {
        match self {
            Self::Exact(p) => p.clone(),
            Self::Prefix(p) => format!("{}*", p),
        }
    }

    /// A concrete path this pattern matches (used for round-trip checks).
    pub fn sample_path(&self) -> String {
        match self {
            Self::Exact(p) => p.clone(),
            Self::Prefix(p) => p.clone(),
        }
    }
}

impl std::fmt::Display for PathPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_pattern())
    }
}

/// Inclusive range of HTTP status codes a probe accepts as healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRange {
    pub min: u16,
    pub max: u16,
}

impl StatusRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, status: u16) -> bool {
        status >= self.min && status <= self.max
    }

    pub fn is_valid(&self) -> bool {
        self.min <= self.max && self.min >= 100 && self.max <= 599
    }
}

impl Default for StatusRange {
    fn default() -> Self {
        Self { min: 200, max: 399 }
    }
}

impl std::fmt::Display for StatusRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// Key of a backend target inside the shared backend state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TargetKey {
    pub pool: String,
    pub target: String,
}

impl TargetKey {
    pub fn new(pool: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            target: target.into(),
        }
    }
}

impl std::fmt::Display for TargetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.pool, self.target)
    }
}
