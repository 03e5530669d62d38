//! Health Monitor
//!
//! Runs one probing loop per health binding of the active routing table and
//! feeds the outcomes into the shared backend state. Status changes follow
//! the hysteresis rule of `TargetHealth::record` and are published as
//! `HealthTransition` events.

use crate::adapters::outbound::DashMapBackendState;
use crate::domain::entities::{HealthBinding, HealthProbe, ProbeOutcome};
use crate::domain::events::GatewayEvent;
use crate::domain::ports::{EventSink, ProbeTarget, Prober, TableObserver};
use crate::domain::services::RoutingTable;
use crate::domain::value_objects::{HealthState, TargetKey};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// What a probing loop runs: the probe definition and the pool's targets.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LoopPlan {
    probe: HealthProbe,
    targets: Vec<String>,
}

struct MonitorLoop {
    plan: LoopPlan,
    handle: JoinHandle<()>,
}

/// Active health monitor.
pub struct HealthMonitor {
    state: Arc<DashMapBackendState>,
    prober: Arc<dyn Prober>,
    events: Arc<dyn EventSink>,
    loops: Mutex<HashMap<HealthBinding, MonitorLoop>>,
}

impl HealthMonitor {
    pub fn new(
        state: Arc<DashMapBackendState>,
        prober: Arc<dyn Prober>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            state,
            prober,
            events,
            loops: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> &Arc<DashMapBackendState> {
        &self.state
    }

    /// Bindings with a running loop.
    pub fn active_bindings(&self) -> Vec<HealthBinding> {
        self.loops.lock().keys().cloned().collect()
    }

    /// Align the running loops with the bindings of `table`.
    ///
    /// Loops whose binding disappeared or whose probe or target list changed
    /// are aborted; new ones are spawned. Health records of targets that are
    /// still present survive the change. Must be called inside a tokio
    /// runtime.
    pub fn reconcile(&self, table: &RoutingTable) {
        let desired = Self::desired_loops(table);

        let mut loops = self.loops.lock();

        loops.retain(|binding, running| {
            let keep = desired.get(binding) == Some(&running.plan);
            if !keep {
                running.handle.abort();
                tracing::debug!("stopped health loop for pool {}", binding.pool);
            }
            keep
        });

        let mut tracked = HashSet::new();
        for (binding, plan) in desired {
            for target in &plan.targets {
                let key = TargetKey::new(binding.pool.as_str(), target.as_str());
                self.state.track(key.clone());
                tracked.insert(key);
            }

            if loops.contains_key(&binding) {
                continue;
            }

            tracing::info!(
                "starting health loop for pool {} ({} targets, probe {} every {:?})",
                binding.pool,
                plan.targets.len(),
                plan.probe.name,
                plan.probe.interval
            );
            let handle = tokio::spawn(Self::run_loop(
                binding.clone(),
                plan.clone(),
                self.state.clone(),
                self.prober.clone(),
                self.events.clone(),
            ));
            loops.insert(binding, MonitorLoop { plan, handle });
        }
        drop(loops);

        let removed = self.state.retain(|key| tracked.contains(key));
        if removed > 0 {
            tracing::info!("dropped health state of {} removed targets", removed);
        }
    }

    /// Run one probing cycle for every active binding right away.
    pub async fn probe_all(&self) {
        let work: Vec<(HealthBinding, LoopPlan)> = self
            .loops
            .lock()
            .iter()
            .map(|(binding, running)| (binding.clone(), running.plan.clone()))
            .collect();

        for (binding, plan) in work {
            Self::run_cycle(&binding, &plan, &self.state, &*self.prober, &*self.events).await;
        }
    }

    /// Abort every probing loop.
    pub fn shutdown(&self) {
        let mut loops = self.loops.lock();
        for (_, running) in loops.drain() {
            running.handle.abort();
        }
    }

    fn desired_loops(table: &RoutingTable) -> HashMap<HealthBinding, LoopPlan> {
        let mut desired = HashMap::new();
        for binding in table.health_bindings() {
            let (Some(probe), Some(pool)) = (table.probe(&binding.probe), table.pool(&binding.pool))
            else {
                tracing::warn!("health binding for pool {} is incomplete", binding.pool);
                continue;
            };
            desired.insert(
                binding.clone(),
                LoopPlan {
                    probe: probe.clone(),
                    targets: pool.targets.clone(),
                },
            );
        }
        desired
    }

    async fn run_loop(
        binding: HealthBinding,
        plan: LoopPlan,
        state: Arc<DashMapBackendState>,
        prober: Arc<dyn Prober>,
        events: Arc<dyn EventSink>,
    ) {
        let mut interval = tokio::time::interval(plan.probe.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            Self::run_cycle(&binding, &plan, &state, &*prober, &*events).await;
        }
    }

    /// Probe all targets of a binding concurrently and record the outcomes.
    async fn run_cycle(
        binding: &HealthBinding,
        plan: &LoopPlan,
        state: &DashMapBackendState,
        prober: &dyn Prober,
        events: &dyn EventSink,
    ) {
        let probes = plan.targets.iter().map(|target| {
            let probe_target = ProbeTarget {
                host: target.clone(),
                port: binding.port,
                protocol: plan.probe.protocol,
                path: plan.probe.path.clone(),
                host_header: binding.host_header.clone(),
                status_range: plan.probe.status_range,
                timeout: plan.probe.timeout,
            };
            async move {
                let outcome = Self::probe_with_timeout(prober, &probe_target).await;
                (target, outcome)
            }
        });

        for (target, outcome) in futures::future::join_all(probes).await {
            let key = TargetKey::new(binding.pool.as_str(), target.as_str());
            let at = Utc::now();

            let Some((old, new)) =
                state.record(&key, &outcome, plan.probe.unhealthy_threshold, at)
            else {
                continue;
            };

            match (&outcome, new) {
                (ProbeOutcome::Failure { reason, .. }, HealthState::Unhealthy) => {
                    tracing::warn!(
                        "backend {} in pool {} is now unhealthy: {}",
                        target,
                        binding.pool,
                        reason
                    );
                }
                _ => {
                    tracing::info!("backend {} in pool {} is now {}", target, binding.pool, new);
                }
            }

            events.emit(GatewayEvent::HealthTransition {
                pool: binding.pool.clone(),
                target: target.clone(),
                old,
                new,
                at,
            });
        }
    }

    /// The prober applies the timeout itself; this bounds a misbehaving one.
    async fn probe_with_timeout(prober: &dyn Prober, target: &ProbeTarget) -> ProbeOutcome {
        let start = Instant::now();
        let limit = target.timeout + Duration::from_millis(100);

        match tokio::time::timeout(limit, prober.probe(target)).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::Failure {
                reason: "probe timeout".to_string(),
                latency_ms: start.elapsed().as_millis() as u64,
            },
        }
    }
}

impl TableObserver for HealthMonitor {
    fn table_changed(&self, table: Arc<RoutingTable>) {
        self.reconcile(&table);
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
