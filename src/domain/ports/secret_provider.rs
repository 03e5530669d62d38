//! Secret Provider Port
//!
//! Certificate material is resolved lazily at bind time through this
//! interface and never stored in the compiled routing table.

use crate::domain::entities::{CertificateMetadata, CertificateRef};
use crate::domain::errors::SecretError;
use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Certificate chain, private key and validity window.
#[derive(Debug)]
pub struct CertificateBundle {
    pub metadata: CertificateMetadata,
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Current validity window of the stored certificate.
    async fn metadata(&self, cert: &CertificateRef) -> Result<CertificateMetadata, SecretError>;

    /// Current certificate material.
    async fn fetch(&self, cert: &CertificateRef) -> Result<CertificateBundle, SecretError>;

    /// Request a fresh certificate and return it once issued.
    async fn renew(&self, cert: &CertificateRef) -> Result<CertificateBundle, SecretError>;
}
