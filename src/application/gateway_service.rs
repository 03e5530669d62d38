//! Gateway Service - Main application use case
//!
//! Owns the active routing table and turns inbound requests into responses:
//! dispatch, cookie affinity, forwarding and error mapping. This is the
//! primary interface for the inbound adapters.

use crate::application::dispatcher::{DispatchOutcome, Dispatcher};
use crate::domain::entities::{ForwardPlan, GatewayRequest};
use crate::domain::errors::{ConfigError, RoutingError};
use crate::domain::events::GatewayEvent;
use crate::domain::gateway_config::GatewayConfig;
use crate::domain::ports::{
    AffinityBinding, AffinityStore, BackendStateReader, EventSink, Forwarder, TableObserver,
};
use crate::domain::services::waf::{WafModeSwitch, BLOCK_BODY};
use crate::domain::services::{RoutingCompiler, RoutingTable, TableHandle};
use crate::domain::value_objects::WafMode;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Session cookie used for backend affinity.
pub const AFFINITY_COOKIE: &str = "GW-AFFINITY";

/// Response handed back to the inbound adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![(
                "content-type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    pub fn redirect(location: &str) -> Self {
        Self {
            status: 301,
            headers: vec![("location".to_string(), location.to_string())],
            body: Bytes::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Generic body for gateway-generated errors. Never names a backend.
fn error_body(status: u16) -> &'static str {
    match status {
        413 => "Request Entity Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

/// Gateway service - main application use case.
///
/// 1. Holds the routing table behind an atomic swap
/// 2. Dispatches each request against a snapshot of it
/// 3. Applies cookie affinity and forwards through the transport port
pub struct GatewayService {
    table: TableHandle,
    dispatcher: Dispatcher,
    backend_state: Arc<dyn BackendStateReader>,
    affinity: Arc<dyn AffinityStore>,
    forwarder: Arc<dyn Forwarder>,
    events: Arc<dyn EventSink>,
    waf_mode: Arc<WafModeSwitch>,
    observers: RwLock<Vec<Arc<dyn TableObserver>>>,
}

impl GatewayService {
    /// Create a new gateway service around an already compiled table.
    pub fn new(
        table: RoutingTable,
        backend_state: Arc<dyn BackendStateReader>,
        affinity: Arc<dyn AffinityStore>,
        forwarder: Arc<dyn Forwarder>,
        events: Arc<dyn EventSink>,
        unknown_grace: Option<Duration>,
    ) -> Self {
        let waf_mode = Arc::new(WafModeSwitch::new(table.waf_policy().mode));
        let dispatcher = Dispatcher::new(
            backend_state.clone(),
            waf_mode.clone(),
            events.clone(),
            unknown_grace,
        );

        Self {
            table: TableHandle::new(table),
            dispatcher,
            backend_state,
            affinity,
            forwarder,
            events,
            waf_mode,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Snapshot of the active routing table.
    pub fn table(&self) -> Arc<RoutingTable> {
        self.table.load()
    }

    pub fn backend_state(&self) -> &Arc<dyn BackendStateReader> {
        &self.backend_state
    }

    pub fn waf_mode(&self) -> WafMode {
        self.waf_mode.get()
    }

    /// Switch the firewall mode for all subsequent requests.
    pub fn set_waf_mode(&self, mode: WafMode) -> WafMode {
        let previous = self.waf_mode.set(mode);
        if previous != mode {
            tracing::info!("WAF mode changed: {} -> {}", previous, mode);
        }
        previous
    }

    /// Register an observer and hand it the current table.
    pub fn add_observer(&self, observer: Arc<dyn TableObserver>) {
        observer.table_changed(self.table.load());
        self.observers.write().push(observer);
    }

    /// Compile and activate a new configuration.
    ///
    /// Fails closed: on any violation the previous table stays active.
    pub fn reconfigure(&self, config: &GatewayConfig) -> Result<Arc<RoutingTable>, ConfigError> {
        let next = match RoutingCompiler::compile(config) {
            Ok(table) => table,
            Err(e) => {
                self.reject(&e);
                return Err(e);
            }
        };

        let listeners_changed = listener_set(&self.table.load()) != listener_set(&next);
        let previous = self.table.swap(next);
        let current = self.table.load();

        if listeners_changed {
            tracing::warn!("listener set changed, restart required to bind new listeners");
        }

        // A document that changes the mode wins over a runtime switch
        let mode = current.waf_policy().mode;
        if previous.waf_policy().mode != mode {
            self.set_waf_mode(mode);
        }

        self.dispatcher.prune(&current);

        tracing::info!(
            "routing table activated: {} listeners, {} pools, {} health bindings",
            current.listeners().len(),
            current.pools().count(),
            current.health_bindings().len()
        );

        for observer in self.observers.read().iter() {
            observer.table_changed(current.clone());
        }

        Ok(current)
    }

    /// Read a configuration document from disk and activate it.
    pub fn reload_file(&self, path: impl AsRef<Path>) -> Result<Arc<RoutingTable>, ConfigError> {
        match GatewayConfig::from_file(path) {
            Ok(config) => self.reconfigure(&config),
            Err(e) => {
                self.reject(&e);
                Err(e)
            }
        }
    }

    fn reject(&self, error: &ConfigError) {
        tracing::error!("configuration rejected, keeping previous table: {}", error);
        let violations = match error.violations() {
            [] => vec![error.to_string()],
            v => v.iter().map(|v| v.to_string()).collect(),
        };
        self.events
            .emit(GatewayEvent::ConfigurationRejected { violations });
    }

    /// Dispatch against the current table without forwarding.
    pub fn dispatch(&self, request: &GatewayRequest) -> Result<DispatchOutcome, RoutingError> {
        self.dispatcher.dispatch(&self.table.load(), request)
    }

    /// Full request pipeline.
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        let table = self.table.load();

        let mut decision = self.dispatcher.decide(&table, &request);
        let set_cookie = match &mut decision.result {
            Ok(DispatchOutcome::Forward(plan)) if plan.settings.cookie_affinity => {
                self.apply_affinity(&table, plan, &request).await
            }
            _ => None,
        };
        self.dispatcher.emit_decision(&request, &decision);

        let plan = match decision.result {
            Ok(DispatchOutcome::Forward(plan)) => plan,
            Ok(DispatchOutcome::Redirect { location, .. }) => {
                return GatewayResponse::redirect(&location);
            }
            Ok(DispatchOutcome::Blocked { status, .. }) => {
                let body = if status == 413 {
                    error_body(status)
                } else {
                    BLOCK_BODY
                };
                return GatewayResponse::text(status, body);
            }
            Err(e) => {
                tracing::warn!("request {} not routed: {}", request.id, e);
                let status = e.status_code();
                return GatewayResponse::text(status, error_body(status));
            }
        };

        match self.forwarder.forward(&plan, &request).await {
            Ok(upstream) => {
                let mut response = GatewayResponse {
                    status: upstream.status,
                    headers: upstream.headers,
                    body: upstream.body,
                };
                if let Some(cookie) = set_cookie {
                    response.headers.push(("set-cookie".to_string(), cookie));
                }
                response
            }
            Err(e) => {
                tracing::warn!("request {} forwarding failed: {}", request.id, e);
                let status = e.status_code();
                GatewayResponse::text(status, error_body(status))
            }
        }
    }

    /// Pin the session to a target, or honour an existing pin.
    ///
    /// A pin is honoured only while its target is still eligible.
    /// Returns the `Set-Cookie` value when a new session was created.
    async fn apply_affinity(
        &self,
        table: &RoutingTable,
        plan: &mut ForwardPlan,
        request: &GatewayRequest,
    ) -> Option<String> {
        let session = request.cookie(AFFINITY_COOKIE).map(str::to_string);

        if let Some(session) = &session {
            let key = affinity_key(session, &plan.pool);
            if let Some(binding) = self.affinity.get(&key).await {
                let eligible = table
                    .pool(&plan.pool)
                    .map(|pool| {
                        self.dispatcher
                            .eligible_targets(pool)
                            .contains(&binding.target.as_str())
                    })
                    .unwrap_or(false);

                if eligible {
                    self.affinity.touch(&key).await;
                    tracing::debug!("affinity {} -> {}", key, binding.target);
                    plan.target = binding.target;
                    return None;
                }

                self.affinity.remove(&key).await;
                tracing::debug!("removed stale affinity {}", key);
            }
        }

        let (session, fresh) = match session {
            Some(s) => (s, false),
            None => (uuid::Uuid::new_v4().to_string(), true),
        };

        self.affinity
            .set(
                affinity_key(&session, &plan.pool),
                AffinityBinding::new(plan.pool.clone(), plan.target.clone()),
            )
            .await;

        fresh.then(|| format!("{}={}; Path=/; HttpOnly", AFFINITY_COOKIE, session))
    }
}

fn affinity_key(session: &str, pool: &str) -> String {
    format!("{}/{}", session, pool)
}

fn listener_set(table: &RoutingTable) -> BTreeSet<(String, u16, String)> {
    table
        .listeners()
        .iter()
        .map(|l| (l.name.clone(), l.port, l.protocol.to_string()))
        .collect()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::domain::entities::TargetHealth;
    use crate::domain::ports::{ForwardError, ForwardedResponse};
    use crate::domain::value_objects::{HealthState, Protocol, TargetKey};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Instant;

    // ===== Mock Implementations =====

    #[derive(Default)]
    struct MockState {
        statuses: Mutex<HashMap<TargetKey, HealthState>>,
    }

    impl MockState {
        fn set(&self, pool: &str, target: &str, status: HealthState) {
            self.statuses
                .lock()
                .insert(TargetKey::new(pool, target), status);
        }
    }

    impl BackendStateReader for MockState {
        fn status(&self, key: &TargetKey) -> HealthState {
            self.statuses.lock().get(key).copied().unwrap_or_default()
        }

        fn health(&self, _key: &TargetKey) -> Option<TargetHealth> {
            None
        }

        fn snapshot(&self) -> Vec<(TargetKey, TargetHealth)> {
            Vec::new()
        }

        fn age(&self) -> Duration {
            Duration::ZERO
        }
    }

    #[derive(Default)]
    struct MockAffinity {
        bindings: Mutex<HashMap<String, AffinityBinding>>,
    }

    #[async_trait]
    impl AffinityStore for MockAffinity {
        async fn get(&self, session: &str) -> Option<AffinityBinding> {
            self.bindings.lock().get(session).cloned()
        }

        async fn set(&self, session: String, binding: AffinityBinding) {
            self.bindings.lock().insert(session, binding);
        }

        async fn remove(&self, session: &str) {
            self.bindings.lock().remove(session);
        }

        async fn touch(&self, session: &str) {
            if let Some(b) = self.bindings.lock().get_mut(session) {
                b.last_seen = Instant::now();
            }
        }

        async fn cleanup_expired(&self, ttl: Duration) -> usize {
            let now = Instant::now();
            let mut bindings = self.bindings.lock();
            let before = bindings.len();
            bindings.retain(|_, b| now.duration_since(b.last_seen) <= ttl);
            before - bindings.len()
        }

        async fn count(&self) -> usize {
            self.bindings.lock().len()
        }
    }

    #[derive(Default)]
    struct MockForwarder {
        plans: Mutex<Vec<ForwardPlan>>,
        fail_with: Option<ForwardError>,
    }

    #[async_trait]
    impl Forwarder for MockForwarder {
        async fn forward(
            &self,
            plan: &ForwardPlan,
            _request: &GatewayRequest,
        ) -> Result<ForwardedResponse, ForwardError> {
            self.plans.lock().push(plan.clone());
            if let Some(e) = &self.fail_with {
                return Err(e.clone());
            }
            Ok(ForwardedResponse {
                status: 200,
                headers: vec![("x-backend".to_string(), plan.target.clone())],
                body: Bytes::from_static(b"ok"),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<GatewayEvent>>,
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: GatewayEvent) {
            self.events.lock().push(event);
        }
    }

    #[derive(Default)]
    struct CountingObserver {
        tables: Mutex<Vec<Arc<RoutingTable>>>,
    }

    impl TableObserver for CountingObserver {
        fn table_changed(&self, table: Arc<RoutingTable>) {
            self.tables.lock().push(table);
        }
    }

    // ===== Test Helpers =====

    fn config_json(mode: &str, affinity: bool) -> String {
        format!(
            r#"{{
            "listeners": [
                {{ "name": "https", "port": 443, "protocol": "https", "certificate": "gw" }},
                {{ "name": "http", "port": 80, "protocol": "http" }}
            ],
            "rules": [
                {{ "name": "default", "listener": "https", "priority": 100, "path": "/*",
                  "target": {{ "backend": {{ "pool": "checkout", "settings": "s" }} }} }},
                {{ "name": "to-https", "listener": "http", "priority": 1, "path": "/*",
                  "target": {{ "redirect": {{ "listener": "https" }} }} }}
            ],
            "pools": [ {{ "name": "checkout", "targets": ["w1", "w2"] }} ],
            "settings": [ {{ "name": "s", "port": 8080, "probe": "p", "cookie_affinity": {} }} ],
            "probes": [ {{ "name": "p", "path": "/health" }} ],
            "waf": {{ "mode": "{}" }},
            "certificates": [ {{ "id": "gw", "material_ref": "kv://gw" }} ]
        }}"#,
            affinity, mode
        )
    }

    fn config(mode: &str, affinity: bool) -> GatewayConfig {
        GatewayConfig::from_json(&config_json(mode, affinity)).unwrap()
    }

    struct Fixture {
        service: GatewayService,
        state: Arc<MockState>,
        forwarder: Arc<MockForwarder>,
        sink: Arc<RecordingSink>,
    }

    fn fixture_with(cfg: GatewayConfig, forwarder: MockForwarder) -> Fixture {
        let state = Arc::new(MockState::default());
        let forwarder = Arc::new(forwarder);
        let sink = Arc::new(RecordingSink::default());
        let service = GatewayService::new(
            RoutingCompiler::compile(&cfg).unwrap(),
            state.clone(),
            Arc::new(MockAffinity::default()),
            forwarder.clone(),
            sink.clone(),
            None,
        );
        Fixture {
            service,
            state,
            forwarder,
            sink,
        }
    }

    fn fixture(mode: &str, affinity: bool) -> Fixture {
        fixture_with(config(mode, affinity), MockForwarder::default())
    }

    fn https(path: &str) -> GatewayRequest {
        GatewayRequest::new(443, Protocol::Https, "GET", path).with_host("app.example.com")
    }

    // ===== handle Tests =====

    #[tokio::test]
    async fn test_handle_forwards_to_backend() {
        let f = fixture("detection", false);
        let response = f.service.handle(https("/menu")).await;

        assert_eq!(response.status, 200);
        assert_eq!(response.body, Bytes::from_static(b"ok"));
        assert_eq!(f.forwarder.plans.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_handle_redirect() {
        let f = fixture("detection", false);
        let req = GatewayRequest::new(80, Protocol::Http, "GET", "/a?b=c").with_host("shop.example.com");
        let response = f.service.handle(req).await;

        assert_eq!(response.status, 301);
        assert_eq!(response.header("Location"), Some("https://shop.example.com/a?b=c"));
        assert!(f.forwarder.plans.lock().is_empty());
    }

    #[tokio::test]
    async fn test_handle_waf_block_leaks_nothing() {
        let f = fixture("prevention", false);
        let response = f.service.handle(https("/?q=<script>alert(1)</script>")).await;

        assert_eq!(response.status, 403);
        let body = String::from_utf8_lossy(&response.body);
        assert_eq!(body, BLOCK_BODY);
        for internal in ["checkout", "w1", "w2", ":8080", "default"] {
            assert!(!body.contains(internal), "block body leaks {internal}");
        }
        assert!(f.forwarder.plans.lock().is_empty());
    }

    #[tokio::test]
    async fn test_handle_no_healthy_backend() {
        let f = fixture("detection", false);
        f.state.set("checkout", "w1", HealthState::Unhealthy);
        f.state.set("checkout", "w2", HealthState::Unhealthy);

        let response = f.service.handle(https("/")).await;
        assert_eq!(response.status, 503);
        assert_eq!(response.body, Bytes::from_static(b"Service Unavailable"));
    }

    #[tokio::test]
    async fn test_handle_forward_timeout() {
        let forwarder = MockForwarder {
            fail_with: Some(ForwardError::Timeout("w1:8080".to_string())),
            ..Default::default()
        };
        let f = fixture_with(config("detection", false), forwarder);

        let response = f.service.handle(https("/")).await;
        assert_eq!(response.status, 504);
        assert!(!String::from_utf8_lossy(&response.body).contains("w1"));
    }

    // ===== Affinity Tests =====

    #[tokio::test]
    async fn test_affinity_pins_session() {
        let f = fixture("detection", true);

        let first = f.service.handle(https("/")).await;
        let cookie = first.header("set-cookie").unwrap().to_string();
        assert!(cookie.starts_with("GW-AFFINITY="));
        let session = cookie
            .trim_start_matches("GW-AFFINITY=")
            .split(';')
            .next()
            .unwrap()
            .to_string();
        let pinned = first.header("x-backend").unwrap().to_string();

        for _ in 0..4 {
            let req = https("/").with_header("Cookie", format!("GW-AFFINITY={}", session));
            let response = f.service.handle(req).await;
            assert_eq!(response.header("x-backend"), Some(pinned.as_str()));
            assert!(response.header("set-cookie").is_none());
        }
    }

    #[tokio::test]
    async fn test_routing_decision_reports_pinned_target() {
        let f = fixture("detection", true);
        f.state.set("checkout", "w1", HealthState::Healthy);
        f.state.set("checkout", "w2", HealthState::Healthy);

        let req = https("/").with_header("Cookie", "GW-AFFINITY=session-1");
        let pinned = f.service.handle(req.clone()).await;
        let pinned = pinned.header("x-backend").unwrap().to_string();

        // round-robin would pick the other target for each of these
        for _ in 0..3 {
            let response = f.service.handle(req.clone()).await;
            assert_eq!(response.header("x-backend"), Some(pinned.as_str()));
        }

        let events = f.sink.events.lock();
        let backends: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                GatewayEvent::RoutingDecision { backend, .. } => backend.as_deref(),
                _ => None,
            })
            .collect();
        assert_eq!(backends.len(), 4);
        assert!(backends.iter().all(|b| *b == pinned));
    }

    #[tokio::test]
    async fn test_affinity_abandoned_when_target_unhealthy() {
        let f = fixture("detection", true);
        f.state.set("checkout", "w1", HealthState::Healthy);
        f.state.set("checkout", "w2", HealthState::Healthy);

        let req = https("/").with_header("Cookie", "GW-AFFINITY=session-1");
        let pinned = f.service.handle(req.clone()).await;
        let pinned = pinned.header("x-backend").unwrap().to_string();

        f.state.set("checkout", &pinned, HealthState::Unhealthy);
        let moved = f.service.handle(req).await;
        assert_ne!(moved.header("x-backend"), Some(pinned.as_str()));
    }

    #[tokio::test]
    async fn test_no_cookie_without_affinity() {
        let f = fixture("detection", false);
        let response = f.service.handle(https("/")).await;
        assert!(response.header("set-cookie").is_none());
    }

    // ===== Reconfiguration Tests =====

    #[tokio::test]
    async fn test_invalid_reconfigure_keeps_previous_table() {
        let f = fixture("detection", false);
        let before = f.service.table();

        let mut broken = config("detection", false);
        broken.rules.retain(|r| r.name != "default");
        assert!(f.service.reconfigure(&broken).is_err());

        assert!(Arc::ptr_eq(&before, &f.service.table()));
        assert_eq!(f.service.handle(https("/")).await.status, 200);
        assert!(f
            .sink
            .events
            .lock()
            .iter()
            .any(|e| matches!(e, GatewayEvent::ConfigurationRejected { .. })));
    }

    #[tokio::test]
    async fn test_reconfigure_swaps_and_notifies() {
        let f = fixture("detection", false);
        let observer = Arc::new(CountingObserver::default());
        f.service.add_observer(observer.clone());
        let in_flight = f.service.table();

        let mut next = config("detection", false);
        next.pools[0].targets = vec!["w9".to_string()];
        f.service.reconfigure(&next).unwrap();

        assert_eq!(in_flight.pool("checkout").unwrap().targets, vec!["w1", "w2"]);
        assert_eq!(f.service.table().pool("checkout").unwrap().targets, vec!["w9"]);
        assert_eq!(observer.tables.lock().len(), 2);

        let response = f.service.handle(https("/")).await;
        assert_eq!(response.header("x-backend"), Some("w9"));
    }

    #[test]
    fn test_runtime_mode_survives_unrelated_reload() {
        let f = fixture("detection", false);
        f.service.set_waf_mode(WafMode::Prevention);

        f.service.reconfigure(&config("detection", false)).unwrap();
        assert_eq!(f.service.waf_mode(), WafMode::Prevention);

        f.service.reconfigure(&config("prevention", false)).unwrap();
        f.service.reconfigure(&config("detection", false)).unwrap();
        assert_eq!(f.service.waf_mode(), WafMode::Detection);
    }

    #[test]
    fn test_reload_missing_file() {
        let f = fixture("detection", false);
        let err = f.service.reload_file("/nonexistent/gateway.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
