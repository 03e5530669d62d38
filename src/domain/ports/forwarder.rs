//! Forwarder Port
//!
//! The dispatcher never moves bytes itself. The transport collaborator
//! receives the (target, settings) plan and performs the proxying.

use crate::domain::entities::{ForwardPlan, GatewayRequest};
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Response received from a backend.
#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[derive(Debug, Clone, Error)]
pub enum ForwardError {
    #[error("backend {0} timed out")]
    Timeout(String),
    #[error("backend {target} unreachable: {reason}")]
    Unreachable { target: String, reason: String },
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
}

impl ForwardError {
    /// Status code reported to the client.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Timeout(_) => 504,
            Self::Unreachable { .. } | Self::InvalidRequest(_) => 502,
        }
    }
}

#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(
        &self,
        plan: &ForwardPlan,
        request: &GatewayRequest,
    ) -> Result<ForwardedResponse, ForwardError>;
}
