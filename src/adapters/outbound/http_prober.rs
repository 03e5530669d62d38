//! HTTP Prober
//!
//! Implements the Prober port with reqwest. One shared client, the probe's
//! own timeout applied per request.

use crate::domain::entities::ProbeOutcome;
use crate::domain::ports::{ProbeTarget, Prober};
use async_trait::async_trait;
use std::time::{Duration, Instant};

pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("edge-gateway-probe/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("probe client build failed, using defaults: {}", e);
                reqwest::Client::new()
            });
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, target: &ProbeTarget) -> ProbeOutcome {
        let start = Instant::now();
        let mut request = self.client.get(target.url()).timeout(target.timeout);
        if let Some(host) = &target.host_header {
            request = request.header(reqwest::header::HOST, host.as_str());
        }

        let result = tokio::time::timeout(target.timeout, request.send()).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(resp)) => {
                let status = resp.status().as_u16();
                if target.status_range.contains(status) {
                    ProbeOutcome::Success {
                        status: Some(status),
                        latency_ms,
                    }
                } else {
                    ProbeOutcome::Failure {
                        reason: format!(
                            "status {} outside expected range {}",
                            status, target.status_range
                        ),
                        latency_ms,
                    }
                }
            }
            Ok(Err(e)) if e.is_timeout() => ProbeOutcome::Failure {
                reason: format!("probe timed out after {:?}", target.timeout),
                latency_ms,
            },
            Ok(Err(e)) => ProbeOutcome::Failure {
                reason: format!("request failed: {}", e),
                latency_ms,
            },
            Err(_) => ProbeOutcome::Failure {
                reason: format!("probe timed out after {:?}", target.timeout),
                latency_ms,
            },
        }
    }
}
