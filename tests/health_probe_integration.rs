//! Integration tests for the Health Monitor with Wiremock
//!
//! Each mock server stands in for one backend pool. The monitor probes it
//! through the real HTTP prober and the gateway routes against the result.

use edge_gateway::adapters::outbound::{
    DashMapAffinityStore, DashMapBackendState, HttpProber, MemoryEventSink, ReqwestForwarder,
};
use edge_gateway::domain::value_objects::TargetKey;
use edge_gateway::{
    BackendStateReader, GatewayConfig, GatewayRequest, GatewayService, HealthMonitor, HealthState,
    Protocol, RoutingCompiler,
};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Two pools on two mock servers. Probes run once an hour so that only the
/// first tick and explicit `probe_all` calls touch the backends.
fn document(healthy_port: u16, sick_port: u16, threshold: u32) -> GatewayConfig {
    let raw = serde_json::json!({
        "listeners": [ { "name": "web", "port": 8080, "protocol": "http" } ],
        "rules": [
            { "name": "default", "listener": "web", "priority": 100, "path": "/*",
              "target": { "backend": { "pool": "healthy-pool", "settings": "healthy-http" } } },
            { "name": "sick", "listener": "web", "priority": 10, "path": "/sick/*",
              "target": { "backend": { "pool": "sick-pool", "settings": "sick-http" } } }
        ],
        "pools": [
            { "name": "healthy-pool", "targets": ["127.0.0.1"] },
            { "name": "sick-pool", "targets": ["127.0.0.1"] }
        ],
        "settings": [
            { "name": "healthy-http", "port": healthy_port, "probe": "hourly",
              "host_header": "app.internal", "request_timeout_secs": 5 },
            { "name": "sick-http", "port": sick_port, "probe": "hourly" }
        ],
        "probes": [
            { "name": "hourly", "path": "/healthz", "interval_secs": 3600, "timeout_secs": 2,
              "unhealthy_threshold": threshold, "status_range": { "min": 200, "max": 299 } }
        ]
    });
    serde_json::from_value(raw).unwrap()
}

fn key(pool: &str) -> TargetKey {
    TargetKey::new(pool, "127.0.0.1")
}

/// Wait for the first tick of the probing loops to decide a target.
async fn wait_decided(state: &DashMapBackendState, key: &TargetKey) -> HealthState {
    for _ in 0..100 {
        let status = state.status(key);
        if status != HealthState::Unknown {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    state.status(key)
}

async fn mount_health(server: &MockServer, status: u16) {
    Mock::given(method("GET"))
        .and(path("/healthz"))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

fn monitor(events: Arc<MemoryEventSink>) -> HealthMonitor {
    HealthMonitor::new(
        Arc::new(DashMapBackendState::new()),
        Arc::new(HttpProber::new()),
        events,
    )
}

/// The first probe decides a target that was Unknown
#[tokio::test]
async fn test_first_probe_decides_unknown_targets() {
    let healthy = MockServer::start().await;
    let sick = MockServer::start().await;
    mount_health(&healthy, 200).await;
    mount_health(&sick, 503).await;

    let table =
        RoutingCompiler::compile(&document(healthy.address().port(), sick.address().port(), 3))
            .unwrap();
    let events = Arc::new(MemoryEventSink::new(64));
    let monitor = monitor(events.clone());
    monitor.reconcile(&table);

    assert_eq!(
        wait_decided(monitor.state(), &key("healthy-pool")).await,
        HealthState::Healthy
    );
    assert_eq!(
        wait_decided(monitor.state(), &key("sick-pool")).await,
        HealthState::Unhealthy
    );
    assert_eq!(events.named("health_transition").len(), 2);

    monitor.shutdown();
}

/// Probes carry the host header override of the backend settings
#[tokio::test]
async fn test_probe_sends_host_header_override() {
    let healthy = MockServer::start().await;
    let sick = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/healthz"))
        .and(header("host", "app.internal"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&healthy)
        .await;
    mount_health(&sick, 200).await;

    let table =
        RoutingCompiler::compile(&document(healthy.address().port(), sick.address().port(), 3))
            .unwrap();
    let monitor = monitor(Arc::new(MemoryEventSink::new(16)));
    monitor.reconcile(&table);

    // Without the header the mock answers 404, which is outside 200-299
    assert_eq!(
        wait_decided(monitor.state(), &key("healthy-pool")).await,
        HealthState::Healthy
    );

    monitor.shutdown();
}

/// Threshold 3: two failures keep a Healthy target, the third flips it,
/// and recovery needs three successes again
#[tokio::test]
async fn test_hysteresis_against_live_backend() {
    let backend = MockServer::start().await;
    let sick = MockServer::start().await;
    mount_health(&backend, 200).await;
    mount_health(&sick, 200).await;

    let table =
        RoutingCompiler::compile(&document(backend.address().port(), sick.address().port(), 3))
            .unwrap();
    let monitor = monitor(Arc::new(MemoryEventSink::new(64)));
    monitor.reconcile(&table);

    let target = key("healthy-pool");
    assert_eq!(
        wait_decided(monitor.state(), &target).await,
        HealthState::Healthy
    );

    backend.reset().await;
    mount_health(&backend, 500).await;

    monitor.probe_all().await;
    monitor.probe_all().await;
    assert_eq!(monitor.state().status(&target), HealthState::Healthy);
    monitor.probe_all().await;
    assert_eq!(monitor.state().status(&target), HealthState::Unhealthy);

    backend.reset().await;
    mount_health(&backend, 200).await;

    monitor.probe_all().await;
    monitor.probe_all().await;
    assert_eq!(monitor.state().status(&target), HealthState::Unhealthy);
    monitor.probe_all().await;
    assert_eq!(monitor.state().status(&target), HealthState::Healthy);

    let health = monitor.state().health(&target).unwrap();
    assert_eq!(health.consecutive_successes, 3);
    assert_eq!(health.consecutive_failures, 0);

    monitor.shutdown();
}

/// Requests flow to the healthy pool and a pool with no eligible target
/// answers 503 without naming the backend
#[tokio::test]
async fn test_gateway_routes_on_probe_results() {
    let healthy = MockServer::start().await;
    let sick = MockServer::start().await;
    mount_health(&healthy, 200).await;
    mount_health(&sick, 503).await;
    Mock::given(method("GET"))
        .and(path("/catalog"))
        .and(header("host", "app.internal"))
        .respond_with(ResponseTemplate::new(200).set_body_string("catalog"))
        .expect(1)
        .mount(&healthy)
        .await;
    Mock::given(method("GET"))
        .and(path("/sick/page"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&sick)
        .await;

    let table =
        RoutingCompiler::compile(&document(healthy.address().port(), sick.address().port(), 3))
            .unwrap();
    let events = Arc::new(MemoryEventSink::new(64));
    let monitor = Arc::new(monitor(events.clone()));
    let service = GatewayService::new(
        table,
        monitor.state().clone(),
        Arc::new(DashMapAffinityStore::new()),
        Arc::new(ReqwestForwarder::new()),
        events.clone(),
        None,
    );
    service.add_observer(monitor.clone());

    assert_eq!(
        wait_decided(monitor.state(), &key("sick-pool")).await,
        HealthState::Unhealthy
    );
    assert_eq!(
        wait_decided(monitor.state(), &key("healthy-pool")).await,
        HealthState::Healthy
    );

    let ok = service
        .handle(GatewayRequest::new(8080, Protocol::Http, "GET", "/catalog"))
        .await;
    assert_eq!(ok.status, 200);
    assert_eq!(&ok.body[..], b"catalog");

    let unavailable = service
        .handle(GatewayRequest::new(8080, Protocol::Http, "GET", "/sick/page"))
        .await;
    assert_eq!(unavailable.status, 503);
    assert!(!String::from_utf8_lossy(&unavailable.body).contains("127.0.0.1"));

    monitor.shutdown();
}

/// Reconfiguring with a new target list keeps the surviving records
#[tokio::test]
async fn test_reconfigure_keeps_surviving_health_state() {
    let healthy = MockServer::start().await;
    let sick = MockServer::start().await;
    mount_health(&healthy, 200).await;
    mount_health(&sick, 503).await;

    let document = document(healthy.address().port(), sick.address().port(), 3);
    let events = Arc::new(MemoryEventSink::new(64));
    let monitor = Arc::new(monitor(events.clone()));
    let service = GatewayService::new(
        RoutingCompiler::compile(&document).unwrap(),
        monitor.state().clone(),
        Arc::new(DashMapAffinityStore::new()),
        Arc::new(ReqwestForwarder::new()),
        events,
        None,
    );
    service.add_observer(monitor.clone());
    assert_eq!(
        wait_decided(monitor.state(), &key("healthy-pool")).await,
        HealthState::Healthy
    );

    let mut next = document.clone();
    next.pools[0].targets.push("127.0.0.2".to_string());
    service.reconfigure(&next).unwrap();

    // The pool's loop restarts with both targets; the old record survives
    assert_eq!(
        monitor.state().status(&key("healthy-pool")),
        HealthState::Healthy
    );
    assert_eq!(monitor.active_bindings().len(), 2);

    monitor.shutdown();
}
