//! File Secret Provider
//!
//! Reads certificate material from a directory. Each certificate is three
//! files named after its material reference:
//!
//! - `<name>.pem`: certificate chain, leaf first
//! - `<name>.key`: private key (PKCS#8, PKCS#1 or SEC1)
//! - `<name>.json`: `{ "not_before": ..., "not_after": ... }`
//!
//! The name is the material reference with any `scheme://` prefix removed.
//! Renewal is performed out of band (an ACME client, an operator); `renew`
//! re-reads the files so a rotated certificate is picked up.

use crate::domain::entities::{CertificateMetadata, CertificateRef};
use crate::domain::errors::SecretError;
use crate::domain::ports::{CertificateBundle, SecretProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct ValidityFile {
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

pub struct FileSecretProvider {
    dir: PathBuf,
}

impl FileSecretProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_stem(material_ref: &str) -> &str {
        match material_ref.split_once("://") {
            Some((_, rest)) => rest.trim_matches('/'),
            None => material_ref,
        }
    }

    fn path(&self, cert: &CertificateRef, ext: &str) -> Result<PathBuf, SecretError> {
        let stem = Self::file_stem(&cert.material_ref);
        if stem.is_empty() || stem.contains("..") || stem.contains('/') {
            return Err(SecretError::InvalidMaterial {
                id: cert.id.clone(),
                reason: format!("unusable material reference '{}'", cert.material_ref),
            });
        }
        Ok(self.dir.join(format!("{}.{}", stem, ext)))
    }

    async fn read(&self, cert: &CertificateRef, ext: &str) -> Result<Vec<u8>, SecretError> {
        let path = self.path(cert, ext)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SecretError::NotFound(cert.id.clone()),
            _ => SecretError::Unavailable(format!("{}: {}", path.display(), e)),
        })
    }

    pub(crate) fn invalid(cert: &CertificateRef, reason: impl Into<String>) -> SecretError {
        SecretError::InvalidMaterial {
            id: cert.id.clone(),
            reason: reason.into(),
        }
    }

    pub(crate) fn parse_chain(
        cert: &CertificateRef,
        pem: &[u8],
    ) -> Result<Vec<CertificateDer<'static>>, SecretError> {
        let chain = rustls_pemfile::certs(&mut &pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Self::invalid(cert, format!("bad certificate PEM: {}", e)))?;
        if chain.is_empty() {
            return Err(Self::invalid(cert, "no certificate in chain file"));
        }
        Ok(chain)
    }

    pub(crate) fn parse_key(
        cert: &CertificateRef,
        pem: &[u8],
    ) -> Result<PrivateKeyDer<'static>, SecretError> {
        rustls_pemfile::private_key(&mut &pem[..])
            .map_err(|e| Self::invalid(cert, format!("bad key PEM: {}", e)))?
            .ok_or_else(|| Self::invalid(cert, "no private key in key file"))
    }
}

#[async_trait]
impl SecretProvider for FileSecretProvider {
    async fn metadata(&self, cert: &CertificateRef) -> Result<CertificateMetadata, SecretError> {
        let raw = self.read(cert, "json").await?;
        let validity: ValidityFile = serde_json::from_slice(&raw)
            .map_err(|e| Self::invalid(cert, format!("bad metadata: {}", e)))?;
        if validity.not_after <= validity.not_before {
            return Err(Self::invalid(cert, "not_after precedes not_before"));
        }

        Ok(CertificateMetadata {
            id: cert.id.clone(),
            material_ref: cert.material_ref.clone(),
            not_before: validity.not_before,
            not_after: validity.not_after,
        })
    }

    async fn fetch(&self, cert: &CertificateRef) -> Result<CertificateBundle, SecretError> {
        let metadata = self.metadata(cert).await?;
        let chain = Self::parse_chain(cert, &self.read(cert, "pem").await?)?;
        let key = Self::parse_key(cert, &self.read(cert, "key").await?)?;

        tracing::debug!(
            "loaded certificate {} from {} ({} in chain)",
            cert.id,
            self.dir.display(),
            chain.len()
        );

        Ok(CertificateBundle {
            metadata,
            chain,
            key,
        })
    }

    async fn renew(&self, cert: &CertificateRef) -> Result<CertificateBundle, SecretError> {
        self.fetch(cert).await
    }
}
