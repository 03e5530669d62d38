//! Caching Secret Provider
//!
//! Wraps another `SecretProvider`. Fetched material is kept for a TTL so
//! repeated binds and polls do not hit the secret store each time, and
//! `renew` always goes to the store and refreshes the cached copy.
//!
//! When the store cannot serve a certificate, material from the process
//! environment is used instead. For a certificate id `gw-cert` the variables
//! are `EDGEGW_CERT_GW_CERT_PEM`, `_KEY`, `_NOT_BEFORE` and `_NOT_AFTER`
//! (RFC 3339). All four must be set.

use super::FileSecretProvider;
use crate::domain::entities::{CertificateMetadata, CertificateRef};
use crate::domain::errors::SecretError;
use crate::domain::ports::{CertificateBundle, SecretProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const ENV_PREFIX: &str = "EDGEGW_CERT_";

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

struct CachedBundle {
    bundle: CertificateBundle,
    stored_at: Instant,
}

pub struct CachingSecretProvider {
    inner: Arc<dyn SecretProvider>,
    ttl: Duration,
    cache: DashMap<String, CachedBundle>,
    env: Option<EnvLookup>,
}

impl CachingSecretProvider {
    /// Cache `inner` for `ttl`. A zero TTL disables caching.
    pub fn new(inner: Arc<dyn SecretProvider>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: DashMap::new(),
            env: None,
        }
    }

    /// Fall back to material in the process environment.
    pub fn with_env_fallback(self) -> Self {
        self.with_env_lookup(|name| std::env::var(name).ok())
    }

    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Some(Box::new(lookup));
        self
    }

    /// Drop the cached material of `cert`.
    pub fn invalidate(&self, cert: &CertificateRef) {
        self.cache.remove(&cert.id);
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Environment variable prefix for a certificate id.
    fn env_prefix(id: &str) -> String {
        let name: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}_", ENV_PREFIX, name)
    }

    fn cached(&self, cert: &CertificateRef) -> Option<CertificateBundle> {
        if self.ttl.is_zero() {
            return None;
        }
        let entry = self.cache.get(&cert.id)?;
        if entry.stored_at.elapsed() >= self.ttl {
            drop(entry);
            self.cache.remove(&cert.id);
            return None;
        }
        tracing::debug!("certificate {} served from cache", cert.id);
        Some(duplicate(&entry.bundle))
    }

    fn store(&self, cert: &CertificateRef, bundle: &CertificateBundle) {
        if self.ttl.is_zero() {
            return;
        }
        self.cache.insert(
            cert.id.clone(),
            CachedBundle {
                bundle: duplicate(bundle),
                stored_at: Instant::now(),
            },
        );
    }

    /// Material from the environment, `None` when fallback is off or any
    /// variable is missing.
    fn from_env(&self, cert: &CertificateRef) -> Option<Result<CertificateBundle, SecretError>> {
        let lookup = self.env.as_ref()?;
        let prefix = Self::env_prefix(&cert.id);
        let var = |suffix: &str| lookup(&format!("{}{}", prefix, suffix));

        let (pem, key, not_before, not_after) =
            (var("PEM")?, var("KEY")?, var("NOT_BEFORE")?, var("NOT_AFTER")?);

        tracing::warn!(
            "using certificate {} from environment variables {}*",
            cert.id,
            prefix
        );
        Some(Self::parse_env(cert, &pem, &key, &not_before, &not_after))
    }

    fn parse_env(
        cert: &CertificateRef,
        pem: &str,
        key: &str,
        not_before: &str,
        not_after: &str,
    ) -> Result<CertificateBundle, SecretError> {
        let date = |raw: &str| {
            DateTime::parse_from_rfc3339(raw.trim())
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| FileSecretProvider::invalid(cert, format!("bad validity date: {}", e)))
        };
        let metadata = CertificateMetadata {
            id: cert.id.clone(),
            material_ref: cert.material_ref.clone(),
            not_before: date(not_before)?,
            not_after: date(not_after)?,
        };
        if metadata.not_after <= metadata.not_before {
            return Err(FileSecretProvider::invalid(cert, "not_after precedes not_before"));
        }

        Ok(CertificateBundle {
            metadata,
            chain: FileSecretProvider::parse_chain(cert, pem.as_bytes())?,
            key: FileSecretProvider::parse_key(cert, key.as_bytes())?,
        })
    }

    /// Replace a store failure with environment material when there is some.
    fn or_env(
        &self,
        cert: &CertificateRef,
        result: Result<CertificateBundle, SecretError>,
    ) -> Result<CertificateBundle, SecretError> {
        match result {
            Ok(bundle) => Ok(bundle),
            Err(e) => {
                tracing::error!("secret store failed for certificate {}: {}", cert.id, e);
                match self.from_env(cert) {
                    Some(fallback) => fallback,
                    None => Err(e),
                }
            }
        }
    }
}

fn duplicate(bundle: &CertificateBundle) -> CertificateBundle {
    CertificateBundle {
        metadata: bundle.metadata.clone(),
        chain: bundle.chain.clone(),
        key: bundle.key.clone_key(),
    }
}

#[async_trait]
impl SecretProvider for CachingSecretProvider {
    async fn metadata(&self, cert: &CertificateRef) -> Result<CertificateMetadata, SecretError> {
        if let Some(bundle) = self.cached(cert) {
            return Ok(bundle.metadata);
        }
        match self.inner.metadata(cert).await {
            Ok(metadata) => Ok(metadata),
            Err(e) => match self.from_env(cert) {
                Some(fallback) => fallback.map(|bundle| bundle.metadata),
                None => Err(e),
            },
        }
    }

    async fn fetch(&self, cert: &CertificateRef) -> Result<CertificateBundle, SecretError> {
        if let Some(bundle) = self.cached(cert) {
            return Ok(bundle);
        }
        let fetched = self.inner.fetch(cert).await;
        if let Ok(bundle) = &fetched {
            self.store(cert, bundle);
        }
        self.or_env(cert, fetched)
    }

    async fn renew(&self, cert: &CertificateRef) -> Result<CertificateBundle, SecretError> {
        self.invalidate(cert);
        let renewed = self.inner.renew(cert).await;
        if let Ok(bundle) = &renewed {
            self.store(cert, bundle);
        }
        renewed
    }
}
