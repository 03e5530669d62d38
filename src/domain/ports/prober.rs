//! Health Prober Port
//!
//! Executes a single synthetic check against one backend target.

use crate::domain::entities::ProbeOutcome;
use crate::domain::value_objects::{Protocol, StatusRange};
use async_trait::async_trait;
use std::time::Duration;

/// Everything a prober needs to check one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub path: String,
    pub host_header: Option<String>,
    pub status_range: StatusRange,
    pub timeout: Duration,
}

impl ProbeTarget {
    pub fn url(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("{}://{}:{}{}", self.protocol.scheme(), host, self.port, self.path)
    }
}

/// Outbound port for probe execution.
///
/// A failed or out-of-range probe is an outcome, not an error.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> ProbeOutcome;
}
