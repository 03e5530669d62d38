//! Request Dispatcher
//!
//! Maps one inbound request to a routing outcome: a forward plan, a
//! redirect or a firewall block. Reads the routing table snapshot and the
//! backend state, never mutates either.

use crate::domain::entities::{BackendPool, ForwardPlan, GatewayRequest, Listener, RuleTarget};
use crate::domain::errors::RoutingError;
use crate::domain::events::{GatewayEvent, RoutingOutcome, WafAction};
use crate::domain::ports::{BackendStateReader, EventSink};
use crate::domain::services::waf::{SizeLimit, WafModeSwitch, WafVerdict};
use crate::domain::services::{RoundRobinSelector, RoutingTable};
use crate::domain::value_objects::{HealthState, TargetKey, WafMode};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of a successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Hand the request to the transport collaborator
    Forward(ForwardPlan),
    /// 301 to another listener
    Redirect {
        listener: String,
        rule: String,
        location: String,
    },
    /// Rejected by the firewall, routing skipped
    Blocked {
        listener: String,
        rule: String,
        status: u16,
    },
}

/// Fields of the routing-decision event, filled in as dispatch proceeds.
#[derive(Default)]
struct DecisionTrace {
    listener: Option<String>,
    rule: Option<String>,
    pool: Option<String>,
}

/// A routed request whose decision event has not been emitted yet.
///
/// Callers may still adjust a forward plan, e.g. to honour session
/// affinity, before handing it to [`Dispatcher::emit_decision`].
pub struct PendingDecision {
    pub result: Result<DispatchOutcome, RoutingError>,
    trace: DecisionTrace,
    started: Instant,
}

pub struct Dispatcher {
    backend_state: Arc<dyn BackendStateReader>,
    waf_mode: Arc<WafModeSwitch>,
    events: Arc<dyn EventSink>,
    selector: RoundRobinSelector,
    /// How long Unknown targets stay eligible. `None` means indefinitely.
    unknown_grace: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        backend_state: Arc<dyn BackendStateReader>,
        waf_mode: Arc<WafModeSwitch>,
        events: Arc<dyn EventSink>,
        unknown_grace: Option<Duration>,
    ) -> Self {
        Self {
            backend_state,
            waf_mode,
            events,
            selector: RoundRobinSelector::new(),
            unknown_grace,
        }
    }

    /// Route a request against a table snapshot.
    ///
    /// Emits exactly one routing-decision event, whatever the outcome.
    pub fn dispatch(
        &self,
        table: &RoutingTable,
        request: &GatewayRequest,
    ) -> Result<DispatchOutcome, RoutingError> {
        let decision = self.decide(table, request);
        self.emit_decision(request, &decision);
        decision.result
    }

    /// Route a request without emitting the decision event.
    pub fn decide(&self, table: &RoutingTable, request: &GatewayRequest) -> PendingDecision {
        let started = Instant::now();
        let mut trace = DecisionTrace::default();
        let result = self.route(table, request, &mut trace);
        PendingDecision {
            result,
            trace,
            started,
        }
    }

    /// Emit the routing-decision event of `decision`. The backend reported
    /// is the target of the forward plan as it stands now.
    pub fn emit_decision(&self, request: &GatewayRequest, decision: &PendingDecision) {
        let (outcome, backend, reason) = match &decision.result {
            Ok(DispatchOutcome::Forward(plan)) => {
                (RoutingOutcome::Forwarded, Some(plan.target.clone()), None)
            }
            Ok(DispatchOutcome::Redirect { .. }) => (RoutingOutcome::Redirected, None, None),
            Ok(DispatchOutcome::Blocked { status, .. }) => (
                RoutingOutcome::Blocked,
                None,
                Some(format!("waf_{}", status)),
            ),
            Err(e) => (RoutingOutcome::Failed, None, Some(e.reason().to_string())),
        };

        let trace = &decision.trace;
        self.events.emit(GatewayEvent::RoutingDecision {
            request_id: request.id.clone(),
            listener: trace.listener.clone(),
            rule: trace.rule.clone(),
            pool: trace.pool.clone(),
            backend,
            outcome,
            reason,
            latency_us: decision.started.elapsed().as_micros() as u64,
        });
    }

    fn route(
        &self,
        table: &RoutingTable,
        request: &GatewayRequest,
        trace: &mut DecisionTrace,
    ) -> Result<DispatchOutcome, RoutingError> {
        // 1. Listener
        let listener = table
            .listener_for(request.port, request.protocol)
            .ok_or(RoutingError::NoListenerMatch {
                port: request.port,
                protocol: request.protocol,
            })?;
        trace.listener = Some(listener.name.clone());

        // 2. First matching rule
        let rule = table.lookup(&listener.name, &request.path).ok_or_else(|| {
            RoutingError::NoRouteMatch {
                listener: listener.name.clone(),
                path: request.path.clone(),
            }
        })?;
        trace.rule = Some(rule.name.clone());

        let (pool_name, settings_name) = match &rule.target {
            RuleTarget::Redirect { listener: target } => {
                let target = table.listener(target).ok_or_else(|| RoutingError::Inconsistent {
                    kind: "listener",
                    name: target.clone(),
                })?;
                return Ok(DispatchOutcome::Redirect {
                    listener: listener.name.clone(),
                    rule: rule.name.clone(),
                    location: redirect_location(target, request),
                });
            }
            RuleTarget::Backend { pool, settings } => (pool, settings),
        };
        trace.pool = Some(pool_name.clone());

        // 3. Firewall
        let mode = self.waf_mode.get();
        let verdict = table.waf_filter().evaluate(request, mode);
        self.record_waf(request, mode, &verdict);
        if let Some(status) = verdict.status() {
            return Ok(DispatchOutcome::Blocked {
                listener: listener.name.clone(),
                rule: rule.name.clone(),
                status,
            });
        }

        // 4. Eligible targets, 5. round-robin
        let pool = table.pool(pool_name).ok_or_else(|| RoutingError::Inconsistent {
            kind: "backend pool",
            name: pool_name.clone(),
        })?;
        let settings = table
            .settings(settings_name)
            .ok_or_else(|| RoutingError::Inconsistent {
                kind: "backend settings",
                name: settings_name.clone(),
            })?;

        let eligible = self.eligible_targets(pool);
        let target = self
            .selector
            .select(&pool.name, &eligible)
            .ok_or_else(|| RoutingError::NoHealthyBackend {
                pool: pool.name.clone(),
            })?;

        // 6. Forwarding context
        Ok(DispatchOutcome::Forward(ForwardPlan {
            listener: listener.name.clone(),
            rule: rule.name.clone(),
            pool: pool.name.clone(),
            target: target.to_string(),
            settings: settings.clone(),
        }))
    }

    /// Healthy targets of a pool, or its Unknown targets while the boot
    /// grace window is open and nothing is Healthy. Never Unhealthy ones.
    pub fn eligible_targets<'a>(&self, pool: &'a BackendPool) -> Vec<&'a str> {
        let mut healthy = Vec::new();
        let mut unknown = Vec::new();

        for target in &pool.targets {
            match self.backend_state.status(&TargetKey::new(&pool.name, target)) {
                HealthState::Healthy => healthy.push(target.as_str()),
                HealthState::Unknown => unknown.push(target.as_str()),
                HealthState::Unhealthy => {}
            }
        }

        if !healthy.is_empty() {
            healthy
        } else if self.grace_open() {
            unknown
        } else {
            Vec::new()
        }
    }

    /// Whether Unknown targets are still routable.
    pub fn grace_open(&self) -> bool {
        match self.unknown_grace {
            None => true,
            Some(window) => self.backend_state.age() < window,
        }
    }

    /// Drop round-robin cursors of pools missing from `table`.
    pub fn prune(&self, table: &RoutingTable) {
        self.selector.retain_pools(|pool| table.pool(pool).is_some());
    }

    fn record_waf(&self, request: &GatewayRequest, mode: WafMode, verdict: &WafVerdict) {
        let action = if verdict.is_rejected() {
            WafAction::Blocked
        } else {
            WafAction::Logged
        };

        for m in verdict.matches() {
            self.events.emit(GatewayEvent::WafMatch {
                request_id: request.id.clone(),
                rule_id: m.rule_id.to_string(),
                mode,
                action,
            });
        }

        if let WafVerdict::Oversized { limit, max, actual } = verdict {
            tracing::debug!(
                "request {} body {} exceeds limit {} ({:?})",
                request.id,
                actual,
                max,
                limit
            );
            let rule_id = match limit {
                SizeLimit::RequestBody => "request_body_limit",
                SizeLimit::FileUpload => "file_upload_limit",
            };
            self.events.emit(GatewayEvent::WafMatch {
                request_id: request.id.clone(),
                rule_id: rule_id.to_string(),
                mode,
                action: WafAction::Blocked,
            });
        }
    }
}

/// Absolute URL on the target listener, keeping path and query.
fn redirect_location(target: &Listener, request: &GatewayRequest) -> String {
    let host = target
        .host_name
        .clone()
        .or_else(|| request.host.as_deref().map(|h| strip_port(h).to_string()))
        .unwrap_or_else(|| "localhost".to_string());

    let port = if target.port == target.protocol.default_port() {
        String::new()
    } else {
        format!(":{}", target.port)
    };

    format!(
        "{}://{}{}{}",
        target.protocol.scheme(),
        host,
        port,
        request.path_and_query()
    )
}

/// Host without its port, keeping IPv6 brackets.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::domain::entities::TargetHealth;
    use crate::domain::gateway_config::GatewayConfig;
    use crate::domain::services::RoutingCompiler;
    use crate::domain::value_objects::Protocol;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    // ===== Mock Implementations =====

    struct MockState {
        statuses: Mutex<HashMap<TargetKey, HealthState>>,
        age: Duration,
    }

    impl MockState {
        fn new(entries: &[(&str, &str, HealthState)]) -> Self {
            Self {
                statuses: Mutex::new(
                    entries
                        .iter()
                        .map(|(p, t, s)| (TargetKey::new(*p, *t), *s))
                        .collect(),
                ),
                age: Duration::ZERO,
            }
        }

        fn aged(mut self, age: Duration) -> Self {
            self.age = age;
            self
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
            self.age
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

    impl RecordingSink {
        fn decisions(&self) -> Vec<GatewayEvent> {
            self.events
                .lock()
                .iter()
                .filter(|e| matches!(e, GatewayEvent::RoutingDecision { .. }))
                .cloned()
                .collect()
        }
    }

    // ===== Test Helpers =====

    const CONFIG: &str = r#"{
        "listeners": [
            { "name": "https", "port": 443, "protocol": "https", "certificate": "gw",
              "host_name": "app.example.com" },
            { "name": "http", "port": 80, "protocol": "http" }
        ],
        "rules": [
            { "name": "default", "listener": "https", "priority": 100, "path": "/*",
              "target": { "backend": { "pool": "web-pool", "settings": "s" } } },
            { "name": "health", "listener": "https", "priority": 5, "path": "/api/health",
              "target": { "backend": { "pool": "health-pool", "settings": "s" } } },
            { "name": "recommend", "listener": "https", "priority": 10, "path": "/recommend/*",
              "target": { "backend": { "pool": "recommend-pool", "settings": "s" } } },
            { "name": "to-https", "listener": "http", "priority": 1, "path": "/*",
              "target": { "redirect": { "listener": "https" } } }
        ],
        "pools": [
            { "name": "web-pool", "targets": ["w1", "w2", "w3"] },
            { "name": "health-pool", "targets": ["h1"] },
            { "name": "recommend-pool", "targets": ["A", "B"] }
        ],
        "settings": [ { "name": "s", "port": 8080, "probe": "p", "host_header": "api.internal" } ],
        "probes": [ { "name": "p", "path": "/health" } ],
        "waf": { "mode": "detection", "max_request_body_bytes": 64 },
        "certificates": [ { "id": "gw", "material_ref": "kv://gw" } ]
    }"#;

    fn table() -> RoutingTable {
        RoutingCompiler::compile(&GatewayConfig::from_json(CONFIG).unwrap()).unwrap()
    }

    fn dispatcher(
        state: MockState,
        mode: WafMode,
        grace: Option<Duration>,
    ) -> (Dispatcher, Arc<RecordingSink>, Arc<WafModeSwitch>) {
        let sink = Arc::new(RecordingSink::default());
        let switch = Arc::new(WafModeSwitch::new(mode));
        let d = Dispatcher::new(Arc::new(state), switch.clone(), sink.clone(), grace);
        (d, sink, switch)
    }

    fn https(path: &str) -> GatewayRequest {
        GatewayRequest::new(443, Protocol::Https, "GET", path).with_host("app.example.com")
    }

    fn forwarded_target(outcome: Result<DispatchOutcome, RoutingError>) -> String {
        match outcome {
            Ok(DispatchOutcome::Forward(plan)) => plan.target,
            other => panic!("expected forward, got {:?}", other),
        }
    }

    // ===== Routing Tests =====

    #[test]
    fn test_unhealthy_target_never_selected() {
        let state = MockState::new(&[
            ("recommend-pool", "A", HealthState::Healthy),
            ("recommend-pool", "B", HealthState::Unhealthy),
        ]);
        let (d, _, _) = dispatcher(state, WafMode::Detection, None);
        let table = table();

        for _ in 0..10 {
            let target = forwarded_target(d.dispatch(&table, &https("/recommend/today")));
            assert_eq!(target, "A");
        }
    }

    #[test]
    fn test_priority_exact_match_beats_default() {
        let (d, _, _) = dispatcher(MockState::new(&[]), WafMode::Detection, None);
        let table = table();

        match d.dispatch(&table, &https("/api/health")).unwrap() {
            DispatchOutcome::Forward(plan) => {
                assert_eq!(plan.rule, "health");
                assert_eq!(plan.pool, "health-pool");
            }
            other => panic!("unexpected {:?}", other),
        }
        match d.dispatch(&table, &https("/api/unknown")).unwrap() {
            DispatchOutcome::Forward(plan) => assert_eq!(plan.rule, "default"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_round_robin_over_healthy_targets() {
        let state = MockState::new(&[
            ("web-pool", "w1", HealthState::Healthy),
            ("web-pool", "w2", HealthState::Unhealthy),
            ("web-pool", "w3", HealthState::Healthy),
        ]);
        let (d, _, _) = dispatcher(state, WafMode::Detection, None);
        let table = table();

        let picked: Vec<_> = (0..4)
            .map(|_| forwarded_target(d.dispatch(&table, &https("/"))))
            .collect();
        assert_eq!(picked, vec!["w1", "w3", "w1", "w3"]);
    }

    #[test]
    fn test_healthy_preferred_over_unknown() {
        let state = MockState::new(&[("web-pool", "w2", HealthState::Healthy)]);
        let (d, _, _) = dispatcher(state, WafMode::Detection, None);
        let table = table();
        for _ in 0..5 {
            assert_eq!(forwarded_target(d.dispatch(&table, &https("/"))), "w2");
        }
    }

    #[test]
    fn test_unknown_targets_used_during_grace() {
        let (d, _, _) = dispatcher(MockState::new(&[]), WafMode::Detection, None);
        let target = forwarded_target(d.dispatch(&table(), &https("/recommend/x")));
        assert_eq!(target, "A");
    }

    #[test]
    fn test_unknown_targets_rejected_after_grace() {
        let state = MockState::new(&[]).aged(Duration::from_secs(120));
        let (d, sink, _) = dispatcher(state, WafMode::Detection, Some(Duration::from_secs(60)));

        let err = d.dispatch(&table(), &https("/recommend/x")).unwrap_err();
        assert_eq!(
            err,
            RoutingError::NoHealthyBackend {
                pool: "recommend-pool".to_string()
            }
        );
        assert_eq!(err.status_code(), 503);

        match &sink.decisions()[0] {
            GatewayEvent::RoutingDecision {
                outcome, reason, ..
            } => {
                assert_eq!(*outcome, RoutingOutcome::Failed);
                assert_eq!(reason.as_deref(), Some("no_healthy_backend"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_all_unhealthy_fails() {
        let state = MockState::new(&[
            ("recommend-pool", "A", HealthState::Unhealthy),
            ("recommend-pool", "B", HealthState::Unhealthy),
        ]);
        let (d, _, _) = dispatcher(state, WafMode::Detection, None);
        assert!(matches!(
            d.dispatch(&table(), &https("/recommend/x")),
            Err(RoutingError::NoHealthyBackend { .. })
        ));
    }

    #[test]
    fn test_no_listener_match() {
        let (d, _, _) = dispatcher(MockState::new(&[]), WafMode::Detection, None);
        let req = GatewayRequest::new(8443, Protocol::Https, "GET", "/");
        let err = d.dispatch(&table(), &req).unwrap_err();
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn test_forward_plan_carries_settings() {
        let (d, _, _) = dispatcher(MockState::new(&[]), WafMode::Detection, None);
        match d.dispatch(&table(), &https("/api/health")).unwrap() {
            DispatchOutcome::Forward(plan) => {
                assert_eq!(plan.authority(), "h1:8080");
                assert_eq!(plan.host_header(), "api.internal");
                assert_eq!(plan.settings.request_timeout, Duration::from_secs(30));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    // ===== Redirect Tests =====

    #[test]
    fn test_redirect_preserves_path_and_query() {
        let (d, _, _) = dispatcher(MockState::new(&[]), WafMode::Detection, None);
        let req = GatewayRequest::new(80, Protocol::Http, "GET", "/menu?city=Seattle")
            .with_host("app.example.com:80");

        match d.dispatch(&table(), &req).unwrap() {
            DispatchOutcome::Redirect { location, rule, .. } => {
                assert_eq!(location, "https://app.example.com/menu?city=Seattle");
                assert_eq!(rule, "to-https");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_redirect_skips_waf() {
        let (d, sink, _) = dispatcher(MockState::new(&[]), WafMode::Prevention, None);
        let req = GatewayRequest::new(80, Protocol::Http, "GET", "/?q=<script>");
        assert!(matches!(
            d.dispatch(&table(), &req),
            Ok(DispatchOutcome::Redirect { .. })
        ));
        assert_eq!(sink.events.lock().len(), 1);
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:8443"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }

    // ===== WAF Tests =====

    #[test]
    fn test_detection_mode_routes_and_logs() {
        let (d, sink, _) = dispatcher(MockState::new(&[]), WafMode::Detection, None);
        let outcome = d.dispatch(&table(), &https("/search?q=<script>alert(1)</script>"));
        assert!(matches!(outcome, Ok(DispatchOutcome::Forward(_))));

        let events = sink.events.lock();
        assert!(events.iter().any(|e| matches!(
            e,
            GatewayEvent::WafMatch { action: WafAction::Logged, mode: WafMode::Detection, .. }
        )));
    }

    #[test]
    fn test_prevention_mode_blocks_before_selection() {
        let (d, sink, _) = dispatcher(MockState::new(&[]), WafMode::Prevention, None);
        let outcome = d.dispatch(&table(), &https("/search?q=<script>alert(1)</script>"));
        assert_eq!(
            outcome,
            Ok(DispatchOutcome::Blocked {
                listener: "https".to_string(),
                rule: "default".to_string(),
                status: 403
            })
        );
        match &sink.decisions()[0] {
            GatewayEvent::RoutingDecision { outcome, backend, .. } => {
                assert_eq!(*outcome, RoutingOutcome::Blocked);
                assert!(backend.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_mode_switch_takes_effect_immediately() {
        let (d, _, switch) = dispatcher(MockState::new(&[]), WafMode::Detection, None);
        let table = table();
        let req = https("/?id=1 UNION SELECT password");

        assert!(matches!(d.dispatch(&table, &req), Ok(DispatchOutcome::Forward(_))));
        switch.set(WafMode::Prevention);
        assert!(matches!(d.dispatch(&table, &req), Ok(DispatchOutcome::Blocked { .. })));
    }

    #[test]
    fn test_oversized_body_blocked_in_detection() {
        let (d, _, _) = dispatcher(MockState::new(&[]), WafMode::Detection, None);
        let req = https("/upload").with_body(vec![b'x'; 100]);
        assert!(matches!(
            d.dispatch(&table(), &req),
            Ok(DispatchOutcome::Blocked { status: 413, .. })
        ));
    }

    // ===== Event Tests =====

    #[test]
    fn test_one_decision_event_per_request() {
        let (d, sink, _) = dispatcher(MockState::new(&[]), WafMode::Detection, None);
        let table = table();
        d.dispatch(&table, &https("/")).unwrap();
        d.dispatch(&table, &https("/api/health")).unwrap();
        let _ = d.dispatch(&table, &GatewayRequest::new(1, Protocol::Http, "GET", "/"));

        let decisions = sink.decisions();
        assert_eq!(decisions.len(), 3);
        match &decisions[1] {
            GatewayEvent::RoutingDecision {
                listener,
                rule,
                pool,
                backend,
                outcome,
                ..
            } => {
                assert_eq!(listener.as_deref(), Some("https"));
                assert_eq!(rule.as_deref(), Some("health"));
                assert_eq!(pool.as_deref(), Some("health-pool"));
                assert_eq!(backend.as_deref(), Some("h1"));
                assert_eq!(*outcome, RoutingOutcome::Forwarded);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
