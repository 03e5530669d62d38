//! Reqwest Forwarder
//!
//! Transport collaborator: proxies a buffered request to the planned
//! backend and returns the buffered response.

use crate::domain::entities::{ForwardPlan, GatewayRequest};
use crate::domain::ports::{ForwardError, ForwardedResponse, Forwarder};
use async_trait::async_trait;
use std::time::Duration;

/// Connection-level headers never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

pub struct ReqwestForwarder {
    client: reqwest::Client,
}

impl ReqwestForwarder {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none())
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("forwarder client build failed, using defaults: {}", e);
                reqwest::Client::new()
            });
        Self { client }
    }

    /// Upstream URL for a plan.
    pub fn upstream_url(plan: &ForwardPlan, request: &GatewayRequest) -> String {
        format!(
            "{}://{}{}",
            plan.settings.protocol.scheme(),
            plan.authority(),
            request.path_and_query()
        )
    }
}

impl Default for ReqwestForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Forwarder for ReqwestForwarder {
    async fn forward(
        &self,
        plan: &ForwardPlan,
        request: &GatewayRequest,
    ) -> Result<ForwardedResponse, ForwardError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;
        let url = Self::upstream_url(plan, request);

        let mut builder = self
            .client
            .request(method, &url)
            .timeout(plan.settings.request_timeout)
            .header(reqwest::header::HOST, plan.host_header());

        for (name, value) in &request.headers {
            if !is_hop_by_hop(name) {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }

        if let Some(addr) = request.client_addr {
            builder = builder.header("x-forwarded-for", addr.ip().to_string());
        }
        builder = builder.header("x-forwarded-proto", request.protocol.scheme());
        if let Some(host) = &request.host {
            builder = builder.header("x-forwarded-host", host.as_str());
        }
        builder = builder.header("x-request-id", request.id.as_str());

        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ForwardError::Timeout(plan.authority())
            } else {
                ForwardError::Unreachable {
                    target: plan.authority(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ForwardError::Timeout(plan.authority())
            } else {
                ForwardError::Unreachable {
                    target: plan.authority(),
                    reason: e.to_string(),
                }
            }
        })?;

        Ok(ForwardedResponse {
            status,
            headers,
            body,
        })
    }
}
