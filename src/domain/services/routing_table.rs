//! Routing Table
//!
//! Immutable result of compiling a gateway configuration, plus the
//! atomically swappable handle the rest of the gateway reads it through.

use crate::domain::entities::{
    BackendPool, BackendSettings, CertificateRef, HealthBinding, HealthProbe, Listener,
    RoutingRule, WafPolicy,
};
use crate::domain::services::waf::WafFilter;
use crate::domain::value_objects::Protocol;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

/// Compiled routing graph.
///
/// Rules are stored per listener in ascending priority order, so a lookup
/// is an ordered linear scan over that listener's rules.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    pub(crate) listeners: Vec<Listener>,
    pub(crate) rules: HashMap<String, Vec<RoutingRule>>,
    pub(crate) pools: HashMap<String, BackendPool>,
    pub(crate) settings: HashMap<String, BackendSettings>,
    pub(crate) probes: HashMap<String, HealthProbe>,
    pub(crate) health_bindings: Vec<HealthBinding>,
    pub(crate) waf: WafPolicy,
    pub(crate) waf_filter: WafFilter,
    pub(crate) certificates: HashMap<String, CertificateRef>,
}

impl RoutingTable {
    /// Listener bound to a (port, protocol) pair.
    pub fn listener_for(&self, port: u16, protocol: Protocol) -> Option<&Listener> {
        self.listeners
            .iter()
            .find(|l| l.port == port && l.protocol == protocol)
    }

    pub fn listener(&self, name: &str) -> Option<&Listener> {
        self.listeners.iter().find(|l| l.name == name)
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    /// Rules of a listener in evaluation order.
    pub fn rules_for(&self, listener: &str) -> &[RoutingRule] {
        self.rules.get(listener).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First rule of the listener whose pattern matches `path`.
    pub fn lookup(&self, listener: &str, path: &str) -> Option<&RoutingRule> {
        self.rules_for(listener)
            .iter()
            .find(|rule| rule.path.matches(path))
    }

    pub fn pool(&self, name: &str) -> Option<&BackendPool> {
        self.pools.get(name)
    }

    pub fn pools(&self) -> impl Iterator<Item = &BackendPool> {
        self.pools.values()
    }

    pub fn settings(&self, name: &str) -> Option<&BackendSettings> {
        self.settings.get(name)
    }

    pub fn probe(&self, name: &str) -> Option<&HealthProbe> {
        self.probes.get(name)
    }

    /// Distinct (pool, probe) monitoring assignments.
    pub fn health_bindings(&self) -> &[HealthBinding] {
        &self.health_bindings
    }

    pub fn waf_policy(&self) -> &WafPolicy {
        &self.waf
    }

    /// Rule set and size limits compiled from the WAF policy.
    pub fn waf_filter(&self) -> &WafFilter {
        &self.waf_filter
    }

    pub fn certificate(&self, id: &str) -> Option<&CertificateRef> {
        self.certificates.get(id)
    }

    /// HTTPS listeners paired with their certificate reference.
    pub fn https_listeners(&self) -> Vec<(&Listener, &CertificateRef)> {
        self.listeners
            .iter()
            .filter(|l| l.protocol == Protocol::Https)
            .filter_map(|l| {
                l.certificate
                    .as_deref()
                    .and_then(|id| self.certificates.get(id))
                    .map(|cert| (l, cert))
            })
            .collect()
    }
}

/// Atomically replaceable reference to the active routing table.
///
/// Readers take an `Arc` snapshot and keep using it for the whole request,
/// so a swap never affects in-flight dispatches.
pub struct TableHandle {
    current: ArcSwap<RoutingTable>,
}

impl TableHandle {
    pub fn new(table: RoutingTable) -> Self {
        Self {
            current: ArcSwap::from_pointee(table),
        }
    }

    /// Snapshot of the active table.
    pub fn load(&self) -> Arc<RoutingTable> {
        self.current.load_full()
    }

    /// Install a new table and return the previous one.
    pub fn swap(&self, table: RoutingTable) -> Arc<RoutingTable> {
        self.current.swap(Arc::new(table))
    }
}
