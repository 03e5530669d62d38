//! Admin API Server
//!
//! Operator HTTP API: liveness, backend health, firewall state and mode
//! switch, configuration reload and certificate status.

use crate::application::GatewayService;
use crate::domain::entities::TargetHealth;
use crate::domain::value_objects::WafMode;
use crate::infrastructure::{CertificateManager, CertificateStatus};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub listeners: usize,
    pub pools: usize,
    pub waf_mode: WafMode,
}

/// One backend target with its health record.
#[derive(Debug, Serialize)]
pub struct BackendStatus {
    pub pool: String,
    pub target: String,
    #[serde(flatten)]
    pub health: TargetHealth,
}

/// List of backends response.
#[derive(Debug, Serialize)]
pub struct BackendsListResponse {
    pub backends: Vec<BackendStatus>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct WafRuleInfo {
    pub id: &'static str,
    pub category: &'static str,
    pub description: &'static str,
}

/// Firewall state response.
#[derive(Debug, Serialize)]
pub struct WafResponse {
    pub mode: WafMode,
    pub rule_set_version: String,
    pub max_request_body_bytes: usize,
    pub file_upload_limit_bytes: usize,
    pub inspect_body: bool,
    pub rules: Vec<WafRuleInfo>,
}

/// Mode switch request.
#[derive(Debug, Clone, Deserialize)]
pub struct WafModeRequest {
    pub mode: WafMode,
}

/// Admin API state.
#[derive(Clone)]
pub struct AdminState {
    pub service: Arc<GatewayService>,
    pub certificates: Option<CertificateManager>,
    /// Routing document reloaded by `POST /api/v1/reload`
    pub config_path: Option<PathBuf>,
}

/// Build the admin router.
pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/backends", get(list_backends_handler))
        .route("/api/v1/waf", get(waf_handler))
        .route("/api/v1/waf/mode", put(waf_mode_handler))
        .route("/api/v1/reload", post(reload_handler))
        .route("/api/v1/certificates", get(certificates_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Admin API server.
pub struct AdminServer {
    listen_addr: String,
    state: AdminState,
}

impl AdminServer {
    pub fn new(listen_addr: String, state: AdminState) -> Self {
        Self { listen_addr, state }
    }

    /// Run the admin server until `shutdown` resolves.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let app = admin_router(self.state);

        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("admin API listening on {}", self.listen_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

// Handler functions

async fn health_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let table = state.service.table();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        listeners: table.listeners().len(),
        pools: table.pools().count(),
        waf_mode: state.service.waf_mode(),
    })
}

async fn list_backends_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let backends: Vec<BackendStatus> = state
        .service
        .backend_state()
        .snapshot()
        .into_iter()
        .map(|(key, health)| BackendStatus {
            pool: key.pool,
            target: key.target,
            health,
        })
        .collect();
    let total = backends.len();
    Json(BackendsListResponse { backends, total })
}

async fn waf_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let table = state.service.table();
    let policy = table.waf_policy();
    let rules = table
        .waf_filter()
        .rule_set()
        .rules()
        .iter()
        .map(|r| WafRuleInfo {
            id: r.id,
            category: r.category.as_str(),
            description: r.description,
        })
        .collect();

    Json(WafResponse {
        mode: state.service.waf_mode(),
        rule_set_version: policy.rule_set_version.clone(),
        max_request_body_bytes: policy.max_request_body_bytes,
        file_upload_limit_bytes: policy.file_upload_limit_bytes,
        inspect_body: policy.inspect_body,
        rules,
    })
}

async fn waf_mode_handler(
    State(state): State<AdminState>,
    Json(req): Json<WafModeRequest>,
) -> impl IntoResponse {
    let previous = state.service.set_waf_mode(req.mode);
    Json(serde_json::json!({
        "previous": previous,
        "mode": req.mode,
    }))
}

async fn reload_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let Some(path) = state.config_path.clone() else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": "no routing configuration file configured"
            })),
        );
    };

    match state.service.reload_file(&path) {
        Ok(table) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "reloaded": true,
                "listeners": table.listeners().len(),
                "pools": table.pools().count(),
                "health_bindings": table.health_bindings().len(),
            })),
        ),
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({
                "reloaded": false,
                "error": e.to_string(),
                "violations": e.violations().iter().map(|v| v.to_string()).collect::<Vec<_>>(),
            })),
        ),
    }
}

async fn certificates_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let certificates: Vec<CertificateStatus> = state
        .certificates
        .as_ref()
        .map(|m| m.statuses(chrono::Utc::now()))
        .unwrap_or_default();
    Json(serde_json::json!({
        "total": certificates.len(),
        "certificates": certificates,
    }))
}
