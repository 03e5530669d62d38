//! Self-Signed Secret Provider
//!
//! Issues certificates locally with rcgen. Used for development and tests
//! where no secret store is available. Every `renew` issues a fresh key and
//! certificate valid for the configured number of days.

use crate::domain::entities::{CertificateMetadata, CertificateRef};
use crate::domain::errors::SecretError;
use crate::domain::ports::{CertificateBundle, SecretProvider};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::collections::HashMap;

struct Issued {
    metadata: CertificateMetadata,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Issued {
    fn bundle(&self) -> CertificateBundle {
        CertificateBundle {
            metadata: self.metadata.clone(),
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

pub struct SelfSignedSecretProvider {
    subject_alt_names: Vec<String>,
    validity_days: u32,
    issued: Mutex<HashMap<String, Issued>>,
}

impl SelfSignedSecretProvider {
    pub fn new(subject_alt_names: Vec<String>, validity_days: u32) -> Self {
        let subject_alt_names = if subject_alt_names.is_empty() {
            vec!["localhost".to_string()]
        } else {
            subject_alt_names
        };
        Self {
            subject_alt_names,
            validity_days: validity_days.max(1),
            issued: Mutex::new(HashMap::new()),
        }
    }

    /// Number of certificates issued so far, renewals included.
    pub fn issued_count(&self) -> usize {
        self.issued.lock().len()
    }

    fn midnight(at: DateTime<Utc>) -> DateTime<Utc> {
        at.date_naive().and_time(NaiveTime::MIN).and_utc()
    }

    fn issue(&self, cert: &CertificateRef) -> Result<Issued, SecretError> {
        let invalid = |reason: String| SecretError::InvalidMaterial {
            id: cert.id.clone(),
            reason,
        };

        // rcgen validity has day granularity
        let not_before = Self::midnight(Utc::now());
        let not_after = not_before + Duration::days(i64::from(self.validity_days));

        let mut params = rcgen::CertificateParams::new(self.subject_alt_names.clone())
            .map_err(|e| invalid(e.to_string()))?;
        params.not_before =
            rcgen::date_time_ymd(not_before.year(), not_before.month() as u8, not_before.day() as u8);
        params.not_after =
            rcgen::date_time_ymd(not_after.year(), not_after.month() as u8, not_after.day() as u8);

        let key_pair = rcgen::KeyPair::generate().map_err(|e| invalid(e.to_string()))?;
        let certificate = params
            .self_signed(&key_pair)
            .map_err(|e| invalid(e.to_string()))?;

        tracing::info!(
            "issued self-signed certificate {} valid until {}",
            cert.id,
            not_after
        );

        Ok(Issued {
            metadata: CertificateMetadata {
                id: cert.id.clone(),
                material_ref: cert.material_ref.clone(),
                not_before,
                not_after,
            },
            chain: vec![certificate.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        })
    }
}

#[async_trait]
impl SecretProvider for SelfSignedSecretProvider {
    async fn metadata(&self, cert: &CertificateRef) -> Result<CertificateMetadata, SecretError> {
        if let Some(issued) = self.issued.lock().get(&cert.id) {
            return Ok(issued.metadata.clone());
        }
        Ok(self.fetch(cert).await?.metadata)
    }

    async fn fetch(&self, cert: &CertificateRef) -> Result<CertificateBundle, SecretError> {
        if let Some(issued) = self.issued.lock().get(&cert.id) {
            return Ok(issued.bundle());
        }

        let issued = self.issue(cert)?;
        let bundle = issued.bundle();
        self.issued.lock().insert(cert.id.clone(), issued);
        Ok(bundle)
    }

    async fn renew(&self, cert: &CertificateRef) -> Result<CertificateBundle, SecretError> {
        let issued = self.issue(cert)?;
        let bundle = issued.bundle();
        self.issued.lock().insert(cert.id.clone(), issued);
        Ok(bundle)
    }
}
