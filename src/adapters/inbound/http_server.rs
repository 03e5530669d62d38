//! HTTP/HTTPS Listener Adapter
//!
//! Accepts client connections on one configured listener, turns each HTTP
//! request into a `GatewayRequest` and writes back the gateway's response.
//! HTTPS listeners terminate TLS with the listener's certificate resolver,
//! so certificate swaps apply to the next handshake.

use crate::application::{GatewayResponse, GatewayService};
use crate::domain::entities::{GatewayRequest, Listener};
use crate::domain::value_objects::Protocol;
use crate::infrastructure::{ListenerCertResolver, ShutdownController};
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Router,
};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower_http::trace::TraceLayer;

/// Per-listener handler state.
#[derive(Clone)]
pub struct ListenerState {
    pub service: Arc<GatewayService>,
    pub port: u16,
    pub protocol: Protocol,
    pub shutdown: ShutdownController,
}

/// Router answering every path of a listener through the gateway.
pub fn listener_router(state: ListenerState) -> Router {
    Router::new()
        .fallback(gateway_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn gateway_handler(
    State(state): State<ListenerState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response {
    let _guard = state.shutdown.request_guard();
    let request = read_request(&state, connect_info.map(|c| c.0), request).await;
    into_response(state.service.handle(request).await)
}

/// Buffer the body up to the firewall limit for its content type.
///
/// A body over the limit is not buffered; its size is still reported so the
/// firewall rejects it.
async fn read_request(
    state: &ListenerState,
    client_addr: Option<SocketAddr>,
    request: Request,
) -> GatewayRequest {
    let (parts, body) = request.into_parts();
    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let (_, limit) = state
        .service
        .table()
        .waf_filter()
        .body_limit_for(content_type);

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut gateway_request =
        GatewayRequest::new(state.port, state.protocol, parts.method.as_str(), path_and_query);

    gateway_request.host = parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()));
    gateway_request.headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    gateway_request.client_addr = client_addr;

    let declared = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    if declared > limit {
        gateway_request.body_len = declared;
        return gateway_request;
    }

    match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => {
            gateway_request.body_len = declared.max(bytes.len());
            gateway_request.body = bytes;
        }
        Err(e) => {
            tracing::debug!("request {} body not buffered: {}", gateway_request.id, e);
            gateway_request.body_len = limit.saturating_add(1);
        }
    }
    gateway_request
}

fn into_response(response: GatewayResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut out = (status, Body::from(response.body)).into_response();

    let headers = out.headers_mut();
    for (name, value) in response.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) else {
            continue;
        };
        headers.append(name, value);
    }
    out
}

/// One bound listener.
pub struct HttpServer {
    listener: Listener,
    bind_addr: String,
    state: ListenerState,
    resolver: Option<Arc<ListenerCertResolver>>,
}

impl HttpServer {
    pub fn new(
        service: Arc<GatewayService>,
        listener: Listener,
        bind_host: &str,
        shutdown: ShutdownController,
    ) -> Self {
        let state = ListenerState {
            service,
            port: listener.port,
            protocol: listener.protocol,
            shutdown,
        };
        Self {
            bind_addr: format!("{}:{}", bind_host, listener.port),
            listener,
            state,
            resolver: None,
        }
    }

    /// Terminate TLS with `resolver`.
    pub fn with_tls(mut self, resolver: Arc<ListenerCertResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Accept connections until shutdown.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(self) -> anyhow::Result<()> {
        let tcp = TcpListener::bind(&self.bind_addr).await?;
        tracing::info!(
            "listener {} ({}) accepting on {}",
            self.listener.name,
            self.listener.protocol,
            self.bind_addr
        );

        let router = listener_router(self.state.clone());
        match (self.listener.protocol, self.resolver) {
            (Protocol::Https, Some(resolver)) => {
                Self::serve_tls(tcp, router, resolver, self.state.shutdown).await
            }
            (Protocol::Https, None) => {
                anyhow::bail!("listener {} has no certificate resolver", self.listener.name)
            }
            (Protocol::Http, _) => {
                axum::serve(
                    tcp,
                    router.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(self.state.shutdown.signalled())
                .await?;
                Ok(())
            }
        }
    }

    fn tls_acceptor(resolver: Arc<ListenerCertResolver>) -> anyhow::Result<TlsAcceptor> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn serve_tls(
        tcp: TcpListener,
        router: Router,
        resolver: Arc<ListenerCertResolver>,
        shutdown: ShutdownController,
    ) -> anyhow::Result<()> {
        let acceptor = Self::tls_acceptor(resolver)?;
        let mut stop = shutdown.subscribe();

        loop {
            let (stream, addr) = tokio::select! {
                accepted = tcp.accept() => accepted?,
                _ = stop.recv() => break,
            };
            let acceptor = acceptor.clone();
            let service = TowerToHyperService::new(
                router.clone().layer(Extension(ConnectInfo(addr))),
            );

            tokio::spawn(async move {
                let tls = match acceptor.accept(stream).await {
                    Ok(tls) => tls,
                    Err(e) => {
                        tracing::debug!("TLS handshake failed from {}: {}", addr, e);
                        return;
                    }
                };
                if let Err(e) = auto::Builder::new(TokioExecutor::new())
                    .serve_connection_with_upgrades(TokioIo::new(tls), service)
                    .await
                {
                    tracing::debug!("connection error from {}: {}", addr, e);
                }
            });
        }

        tracing::info!("TLS listener stopped accepting");
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::{DashMapAffinityStore, DashMapBackendState, MemoryEventSink};
    use crate::domain::gateway_config::GatewayConfig;
    use crate::domain::ports::{ForwardError, ForwardedResponse, Forwarder};
    use crate::domain::entities::ForwardPlan;
    use crate::domain::services::RoutingCompiler;
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use parking_lot::Mutex;
    use tower::ServiceExt;

    /// Echoes the forward plan and records the request it saw.
    struct EchoForwarder {
        seen: Mutex<Vec<GatewayRequest>>,
    }

    #[async_trait]
    impl Forwarder for EchoForwarder {
        async fn forward(
            &self,
            plan: &ForwardPlan,
            request: &GatewayRequest,
        ) -> Result<ForwardedResponse, ForwardError> {
            self.seen.lock().push(request.clone());
            Ok(ForwardedResponse {
                status: 200,
                headers: vec![("x-backend".to_string(), plan.target.clone())],
                body: bytes::Bytes::from(format!("{} {}", plan.pool, plan.target)),
            })
        }
    }

    const UPLOAD_CONFIG: &str = r#"{
        "listeners": [ { "name": "http", "port": 8080, "protocol": "http" } ],
        "rules": [
            { "name": "default", "listener": "http", "priority": 100, "path": "/*",
              "target": { "backend": { "pool": "web", "settings": "s" } } }
        ],
        "pools": [ { "name": "web", "targets": ["10.0.0.1"] } ],
        "settings": [ { "name": "s", "port": 80, "probe": "p" } ],
        "probes": [ { "name": "p", "path": "/" } ],
        "waf": { "mode": "prevention", "max_request_body_bytes": 64,
                 "file_upload_limit_bytes": 1048576 }
    }"#;

    const CONFIG: &str = r#"{
        "listeners": [ { "name": "http", "port": 8080, "protocol": "http" } ],
        "rules": [
            { "name": "default", "listener": "http", "priority": 100, "path": "/*",
              "target": { "backend": { "pool": "web", "settings": "s" } } }
        ],
        "pools": [ { "name": "web", "targets": ["10.0.0.1"] } ],
        "settings": [ { "name": "s", "port": 80, "probe": "p" } ],
        "probes": [ { "name": "p", "path": "/" } ],
        "waf": { "mode": "prevention", "max_request_body_bytes": 64, "file_upload_limit_bytes": 64 }
    }"#;

    fn setup() -> (Router, Arc<EchoForwarder>) {
        setup_with(CONFIG)
    }

    fn setup_with(config: &str) -> (Router, Arc<EchoForwarder>) {
        let table = RoutingCompiler::compile(&GatewayConfig::from_json(config).unwrap()).unwrap();
        let forwarder = Arc::new(EchoForwarder {
            seen: Mutex::new(Vec::new()),
        });
        // no probes run: targets stay Unknown inside an unlimited grace window
        let service = Arc::new(GatewayService::new(
            table,
            Arc::new(DashMapBackendState::new()),
            Arc::new(DashMapAffinityStore::new()),
            forwarder.clone(),
            Arc::new(MemoryEventSink::new(16)),
            None,
        ));
        let router = listener_router(ListenerState {
            service,
            port: 8080,
            protocol: Protocol::Http,
            shutdown: ShutdownController::new(),
        });
        (router, forwarder)
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_request_is_forwarded() {
        let (router, forwarder) = setup();

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/orders?id=1")
                    .header("host", "app.example.com")
                    .header("content-type", "application/json")
                    .body(Body::from("{\"qty\":1}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-backend"], "10.0.0.1");
        assert_eq!(body_string(response).await, "web 10.0.0.1");

        let seen = forwarder.seen.lock();
        assert_eq!(seen[0].path, "/orders");
        assert_eq!(seen[0].query.as_deref(), Some("id=1"));
        assert_eq!(seen[0].host.as_deref(), Some("app.example.com"));
        assert_eq!(seen[0].header("content-type"), Some("application/json"));
        assert_eq!(&seen[0].body[..], b"{\"qty\":1}");
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let (router, forwarder) = setup();

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/upload")
                    .body(Body::from(vec![b'a'; 200]))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(forwarder.seen.lock().is_empty());
    }

    /// A stream that sends `first` and then never finishes.
    fn stalled_body(first: Vec<u8>) -> Body {
        use futures::StreamExt;
        let stream = futures::stream::iter([Ok::<_, std::io::Error>(bytes::Bytes::from(first))])
            .chain(futures::stream::pending());
        Body::from_stream(stream)
    }

    #[tokio::test]
    async fn test_json_body_capped_at_body_limit() {
        let (router, forwarder) = setup_with(UPLOAD_CONFIG);

        // unannounced length: only the body limit may be buffered, so the
        // request is rejected without waiting for the stream to end
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/orders")
            .header("content-type", "application/json")
            .body(stalled_body(vec![b'a'; 200]))
            .unwrap();

        let response = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            router.oneshot(request),
        )
        .await
        .expect("json body buffered past the body limit")
        .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(forwarder.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_multipart_body_buffered_to_upload_limit() {
        let (router, forwarder) = setup_with(UPLOAD_CONFIG);

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/upload")
                    .header("content-type", "multipart/form-data; boundary=x")
                    .body(Body::from(vec![b'a'; 4096]))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(forwarder.seen.lock()[0].body.len(), 4096);
    }

    #[tokio::test]
    async fn test_waf_block_returns_fixed_body() {
        let (router, forwarder) = setup();

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/search?q=1%27%20OR%20%271%27%3D%271")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_string(response).await;
        assert!(!body.contains("10.0.0.1"));
        assert!(forwarder.seen.lock().is_empty());
    }

    #[test]
    fn test_into_response_skips_invalid_headers() {
        let response = into_response(GatewayResponse {
            status: 201,
            headers: vec![
                ("x-ok".to_string(), "1".to_string()),
                ("bad header".to_string(), "2".to_string()),
            ],
            body: bytes::Bytes::from_static(b"done"),
        });
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-ok"], "1");
        assert_eq!(response.headers().len(), 1);
    }
}
