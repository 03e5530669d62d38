//! Certificate Manager
//!
//! Keeps the active certificate of every HTTPS listener behind an `ArcSwap`
//! and renews it before expiry. The TLS acceptor reads the binding through
//! `ListenerCertResolver` on every handshake, so a swap only affects new
//! handshakes; established sessions keep the key they negotiated with.
//!
//! A listener whose certificate cannot be loaded still gets a binding. It
//! stays pending, refuses handshakes and is retried on every poll.

use crate::domain::entities::{CertificateMetadata, CertificateRef};
use crate::domain::errors::{CertificateError, SecretError};
use crate::domain::events::{AlertSeverity, GatewayEvent};
use crate::domain::ports::{CertificateBundle, EventSink, SecretProvider, TableObserver};
use crate::domain::services::RoutingTable;
use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Certificate material currently served on a listener.
pub struct ActiveCertificate {
    pub metadata: CertificateMetadata,
    key: Arc<CertifiedKey>,
}

impl std::fmt::Debug for ActiveCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveCertificate")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Per-listener certificate binding.
pub struct ListenerCertificate {
    listener: String,
    certificate: ArcSwap<CertificateRef>,
    active: ArcSwapOption<ActiveCertificate>,
    renewal_due: AtomicBool,
    /// The declared certificate has not been loaded yet
    pending: AtomicBool,
}

impl std::fmt::Debug for ListenerCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerCertificate")
            .field("listener", &self.listener)
            .field("certificate", &self.certificate.load().id)
            .field("not_after", &self.metadata().map(|m| m.not_after))
            .field("renewal_due", &self.renewal_due())
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl ListenerCertificate {
    fn new(listener: &str, certificate: &CertificateRef) -> Self {
        Self {
            listener: listener.to_string(),
            certificate: ArcSwap::from_pointee(certificate.clone()),
            active: ArcSwapOption::empty(),
            renewal_due: AtomicBool::new(true),
            pending: AtomicBool::new(true),
        }
    }

    pub fn listener(&self) -> &str {
        &self.listener
    }

    pub fn certificate(&self) -> Arc<CertificateRef> {
        self.certificate.load_full()
    }

    /// Validity of the served certificate, `None` while nothing was loaded.
    pub fn metadata(&self) -> Option<CertificateMetadata> {
        self.active.load_full().map(|a| a.metadata.clone())
    }

    pub fn renewal_due(&self) -> bool {
        self.renewal_due.load(Ordering::SeqCst)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Key to present at `now`, `None` when nothing is loaded or the
    /// certificate has expired.
    pub fn key_at(&self, now: DateTime<Utc>) -> Option<Arc<CertifiedKey>> {
        let active = self.active.load();
        match &*active {
            Some(a) if !a.metadata.is_expired(now) => Some(a.key.clone()),
            _ => None,
        }
    }

    fn install(&self, certificate: &CertificateRef, active: ActiveCertificate, due: bool) {
        self.certificate.store(Arc::new(certificate.clone()));
        self.active.store(Some(Arc::new(active)));
        self.renewal_due.store(due, Ordering::SeqCst);
        self.pending.store(false, Ordering::SeqCst);
    }

    /// Point the binding at a certificate that still has to be loaded. The
    /// previous material, if any, keeps serving until it expires.
    fn await_certificate(&self, certificate: &CertificateRef) {
        self.certificate.store(Arc::new(certificate.clone()));
        self.renewal_due.store(true, Ordering::SeqCst);
        self.pending.store(true, Ordering::SeqCst);
    }
}

/// rustls resolver bound to one listener.
pub struct ListenerCertResolver {
    binding: Arc<ListenerCertificate>,
}

impl std::fmt::Debug for ListenerCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerCertResolver")
            .field("listener", &self.binding.listener)
            .finish()
    }
}

impl ResolvesServerCert for ListenerCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let key = self.binding.key_at(Utc::now());
        if key.is_none() {
            tracing::warn!(
                "refusing handshake on listener {}: no valid certificate",
                self.binding.listener
            );
        }
        key
    }
}

/// Certificate state as reported by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateStatus {
    pub listener: String,
    pub certificate: String,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub renewal_due: bool,
    pub expired: bool,
    pub pending: bool,
}

/// Outcome of one polling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub checked: usize,
    pub renewed: usize,
    pub failed: usize,
}

/// Certificate/listener manager.
#[derive(Clone)]
pub struct CertificateManager {
    provider: Arc<dyn SecretProvider>,
    events: Arc<dyn EventSink>,
    bindings: Arc<DashMap<String, Arc<ListenerCertificate>>>,
}

impl CertificateManager {
    pub fn new(provider: Arc<dyn SecretProvider>, events: Arc<dyn EventSink>) -> Self {
        Self {
            provider,
            events,
            bindings: Arc::new(DashMap::new()),
        }
    }

    pub fn binding(&self, listener: &str) -> Option<Arc<ListenerCertificate>> {
        self.bindings.get(listener).map(|b| b.value().clone())
    }

    /// Resolver for the TLS acceptor of `listener`.
    pub fn resolver(&self, listener: &str) -> Option<Arc<ListenerCertResolver>> {
        self.binding(listener)
            .map(|binding| Arc::new(ListenerCertResolver { binding }))
    }

    pub fn statuses(&self, now: DateTime<Utc>) -> Vec<CertificateStatus> {
        let mut out: Vec<CertificateStatus> = self
            .bindings
            .iter()
            .map(|entry| {
                let binding = entry.value();
                let metadata = binding.metadata();
                CertificateStatus {
                    listener: binding.listener.clone(),
                    certificate: binding.certificate().id.clone(),
                    not_before: metadata.as_ref().map(|m| m.not_before),
                    not_after: metadata.as_ref().map(|m| m.not_after),
                    renewal_due: binding.renewal_due(),
                    expired: metadata.as_ref().map_or(false, |m| m.is_expired(now)),
                    pending: binding.is_pending(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.listener.cmp(&b.listener));
        out
    }

    /// Resolve and bind the certificate of an HTTPS listener.
    ///
    /// The binding exists afterwards whatever the outcome. When the material
    /// cannot be used (provider error, expired) the binding stays pending,
    /// an alert is raised and the error is returned; the next poll retries.
    /// A certificate already inside its renewal window is bound and marked
    /// due, so the next poll renews it.
    pub async fn activate(
        &self,
        listener: &str,
        certificate: &CertificateRef,
        now: DateTime<Utc>,
    ) -> Result<Arc<ListenerCertificate>, CertificateError> {
        let binding = self
            .bindings
            .entry(listener.to_string())
            .or_insert_with(|| Arc::new(ListenerCertificate::new(listener, certificate)))
            .value()
            .clone();

        match self.load(listener, certificate, now).await {
            Ok(active) => {
                self.bind(&binding, certificate, active, now);
                Ok(binding)
            }
            Err(e) => {
                binding.await_certificate(certificate);
                let not_after = match &e {
                    CertificateError::Expired { not_after, .. } => Some(*not_after),
                    _ => None,
                };
                self.alert(
                    listener,
                    certificate,
                    AlertSeverity::Critical,
                    format!("{}, listener refuses handshakes until a certificate is loaded", e),
                    not_after,
                );
                Err(e)
            }
        }
    }

    async fn load(
        &self,
        listener: &str,
        certificate: &CertificateRef,
        now: DateTime<Utc>,
    ) -> Result<ActiveCertificate, CertificateError> {
        let bundle = self.provider.fetch(certificate).await?;

        if bundle.metadata.is_expired(now) {
            return Err(CertificateError::Expired {
                listener: listener.to_string(),
                id: certificate.id.clone(),
                not_after: bundle.metadata.not_after,
            });
        }
        if bundle.metadata.is_not_yet_valid(now) {
            tracing::warn!(
                "certificate {} for listener {} is not valid before {}",
                certificate.id,
                listener,
                bundle.metadata.not_before
            );
        }

        Ok(Self::active_certificate(bundle)?)
    }

    fn bind(
        &self,
        binding: &ListenerCertificate,
        certificate: &CertificateRef,
        active: ActiveCertificate,
        now: DateTime<Utc>,
    ) {
        let due = active
            .metadata
            .renewal_due(now, certificate.renewal_lead_time);
        let not_after = active.metadata.not_after;
        binding.install(certificate, active, due);

        tracing::info!(
            "listener {} serving certificate {} (expires {})",
            binding.listener,
            certificate.id,
            not_after
        );
        if due {
            self.alert(
                &binding.listener,
                certificate,
                AlertSeverity::Warning,
                format!("certificate expires at {}, renewal due", not_after),
                Some(not_after),
            );
        }
    }

    /// Bind every HTTPS listener of `table` whose certificate is not bound yet
    /// or changed, and drop bindings of listeners the table no longer has.
    /// Failures are logged and alerted, never propagated.
    pub async fn sync(&self, table: &RoutingTable, now: DateTime<Utc>) -> usize {
        let https = table.https_listeners();

        let wanted: HashSet<&str> = https.iter().map(|(l, _)| l.name.as_str()).collect();
        self.bindings.retain(|listener, _| {
            let keep = wanted.contains(listener.as_str());
            if !keep {
                tracing::info!("dropped certificate binding of removed listener {}", listener);
            }
            keep
        });

        let mut activated = 0;
        for (listener, certificate) in https {
            let current = self.binding(&listener.name).map(|b| b.certificate());
            if current.as_deref() == Some(certificate) {
                continue;
            }
            match self.activate(&listener.name, certificate, now).await {
                Ok(_) => activated += 1,
                Err(e) => tracing::error!("listener {}: {}", listener.name, e),
            }
        }
        activated
    }

    /// One renewal pass over all bindings.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> PollSummary {
        let bindings: Vec<Arc<ListenerCertificate>> =
            self.bindings.iter().map(|e| e.value().clone()).collect();

        let mut summary = PollSummary::default();
        for binding in bindings {
            summary.checked += 1;
            match self.poll_binding(&binding, now).await {
                Some(true) => summary.renewed += 1,
                Some(false) => summary.failed += 1,
                None => {}
            }
        }
        summary
    }

    /// `Some(true)` when a newer certificate was installed, `Some(false)`
    /// when a due renewal failed, `None` when nothing was needed.
    async fn poll_binding(&self, binding: &ListenerCertificate, now: DateTime<Utc>) -> Option<bool> {
        if binding.is_pending() {
            return Some(self.retry_pending(binding, now).await);
        }

        let certificate = binding.certificate();
        let current = binding.metadata()?;

        match self.provider.metadata(&certificate).await {
            Ok(fresh) if fresh.not_after > current.not_after => {
                // rotated out of band
                let result = match self.provider.fetch(&certificate).await {
                    Ok(bundle) => self.install_renewed(binding, &certificate, &current, bundle, now),
                    Err(e) => Err(e.to_string()),
                };
                return Some(self.settle(binding, &certificate, &current, result));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    "metadata refresh for certificate {} failed: {}",
                    certificate.id,
                    e
                );
            }
        }

        if current.is_expired(now) {
            self.alert(
                &binding.listener,
                &certificate,
                AlertSeverity::Critical,
                "certificate expired, new handshakes refused".to_string(),
                Some(current.not_after),
            );
        }

        if !binding.renewal_due() && !current.renewal_due(now, certificate.renewal_lead_time) {
            return None;
        }

        if !binding.renewal_due.swap(true, Ordering::SeqCst) {
            self.alert(
                &binding.listener,
                &certificate,
                AlertSeverity::Warning,
                format!("certificate expires at {}, renewal due", current.not_after),
                Some(current.not_after),
            );
        }

        tracing::info!(
            "requesting renewal of certificate {} for listener {}",
            certificate.id,
            binding.listener
        );

        let result = match self.provider.renew(&certificate).await {
            Ok(bundle) => self.install_renewed(binding, &certificate, &current, bundle, now),
            Err(e) => Err(e.to_string()),
        };
        Some(self.settle(binding, &certificate, &current, result))
    }

    /// Load the declared certificate of a pending binding: the stored
    /// material first, a renewal when that is missing or expired.
    async fn retry_pending(&self, binding: &ListenerCertificate, now: DateTime<Utc>) -> bool {
        let certificate = binding.certificate();
        let previous = binding.metadata();

        let active = match self.load(&binding.listener, &certificate, now).await {
            Ok(active) => Ok(active),
            Err(e) => {
                tracing::info!(
                    "certificate {} for listener {} unusable ({}), requesting renewal",
                    certificate.id,
                    binding.listener,
                    e
                );
                match self.provider.renew(&certificate).await {
                    Ok(bundle) if bundle.metadata.is_expired(now) => Err(format!(
                        "provider returned a certificate expiring at {}",
                        bundle.metadata.not_after
                    )),
                    Ok(bundle) => Self::active_certificate(bundle).map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                }
            }
        };

        match active {
            Ok(active) => {
                let new_expiry = active.metadata.not_after;
                self.bind(binding, &certificate, active, now);
                if let Some(old) = previous {
                    self.events.emit(GatewayEvent::CertificateRenewed {
                        listener: binding.listener.clone(),
                        certificate: certificate.id.clone(),
                        old_expiry: old.not_after,
                        new_expiry,
                    });
                }
                true
            }
            Err(reason) => {
                let err = CertificateError::RenewalFailed {
                    listener: binding.listener.clone(),
                    id: certificate.id.clone(),
                    reason,
                };
                tracing::error!("{}", err);
                self.alert(
                    &binding.listener,
                    &certificate,
                    AlertSeverity::Critical,
                    err.to_string(),
                    previous.map(|m| m.not_after),
                );
                false
            }
        }
    }

    fn settle(
        &self,
        binding: &ListenerCertificate,
        certificate: &CertificateRef,
        current: &CertificateMetadata,
        result: Result<(), String>,
    ) -> bool {
        match result {
            Ok(()) => true,
            Err(reason) => {
                self.renewal_failed(binding, certificate, current, reason);
                false
            }
        }
    }

    fn install_renewed(
        &self,
        binding: &ListenerCertificate,
        certificate: &CertificateRef,
        current: &CertificateMetadata,
        bundle: CertificateBundle,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        if bundle.metadata.not_after <= current.not_after || bundle.metadata.is_expired(now) {
            return Err(format!(
                "provider returned a certificate expiring at {}",
                bundle.metadata.not_after
            ));
        }

        let active = Self::active_certificate(bundle).map_err(|e| e.to_string())?;
        let new_expiry = active.metadata.not_after;
        let due = active
            .metadata
            .renewal_due(now, certificate.renewal_lead_time);
        binding.install(certificate, active, due);

        tracing::info!(
            "renewed certificate {} for listener {}: {} -> {}",
            certificate.id,
            binding.listener,
            current.not_after,
            new_expiry
        );
        self.events.emit(GatewayEvent::CertificateRenewed {
            listener: binding.listener.clone(),
            certificate: certificate.id.clone(),
            old_expiry: current.not_after,
            new_expiry,
        });
        Ok(())
    }

    fn renewal_failed(
        &self,
        binding: &ListenerCertificate,
        certificate: &CertificateRef,
        current: &CertificateMetadata,
        reason: String,
    ) {
        let err = CertificateError::RenewalFailed {
            listener: binding.listener.clone(),
            id: certificate.id.clone(),
            reason,
        };
        tracing::error!("{}", err);
        self.alert(
            &binding.listener,
            certificate,
            AlertSeverity::Critical,
            err.to_string(),
            Some(current.not_after),
        );
    }

    fn alert(
        &self,
        listener: &str,
        certificate: &CertificateRef,
        severity: AlertSeverity,
        reason: String,
        not_after: Option<DateTime<Utc>>,
    ) {
        self.events.emit(GatewayEvent::CertificateAlert {
            listener: listener.to_string(),
            certificate: certificate.id.clone(),
            severity,
            reason,
            not_after,
        });
    }

    fn active_certificate(bundle: CertificateBundle) -> Result<ActiveCertificate, SecretError> {
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&bundle.key).map_err(|e| {
            SecretError::InvalidMaterial {
                id: bundle.metadata.id.clone(),
                reason: e.to_string(),
            }
        })?;

        Ok(ActiveCertificate {
            key: Arc::new(CertifiedKey::new(bundle.chain, signing_key)),
            metadata: bundle.metadata,
        })
    }

    /// Spawn the polling loop.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start(&self, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let summary = manager.poll_once(Utc::now()).await;
                if summary.renewed > 0 || summary.failed > 0 {
                    tracing::info!(
                        "certificate poll: {} checked, {} renewed, {} failed",
                        summary.checked,
                        summary.renewed,
                        summary.failed
                    );
                }
            }
        })
    }
}

impl TableObserver for CertificateManager {
    fn table_changed(&self, table: Arc<RoutingTable>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no runtime available, certificate sync skipped");
            return;
        };
        let manager = self.clone();
        runtime.spawn(async move {
            manager.sync(&table, Utc::now()).await;
        });
    }
}
