//! Certificate trust store shared between TLS secret creation and probing

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use tracing::warn;

/// Set of CA certificates an [`crate::http::HttpClient`] trusts
///
/// Clones share the same underlying set, so a certificate added after a
/// client handle was cloned is still seen by clients built later.
#[derive(Clone, Default)]
pub struct TrustStore {
    certificates: Arc<RwLock<Vec<CertificateDer<'static>>>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a DER certificate; adding one that is already present is a no-op
    pub fn add(&self, certificate: CertificateDer<'static>) {
        let mut certificates = self
            .certificates
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !certificates.contains(&certificate) {
            certificates.push(certificate);
        }
    }

    /// Remove a certificate, returning whether it was present
    pub fn remove(&self, certificate: &CertificateDer<'_>) -> bool {
        let mut certificates = self
            .certificates
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = certificates.len();
        certificates.retain(|c| c.as_ref() != certificate.as_ref());
        certificates.len() != before
    }

    pub fn contains(&self, certificate: &CertificateDer<'_>) -> bool {
        self.certificates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|c| c.as_ref() == certificate.as_ref())
    }

    pub fn len(&self) -> usize {
        self.certificates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current certificates as rustls trust anchors
    pub fn root_store(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        let certificates = self
            .certificates
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for certificate in certificates.iter() {
            if let Err(e) = roots.add(certificate.clone()) {
                warn!(error = %e, "Skipping unusable trust anchor");
            }
        }
        roots
    }

    /// Whether both handles share the same set
    pub fn same_store(&self, other: &TrustStore) -> bool {
        Arc::ptr_eq(&self.certificates, &other.certificates)
    }
}

impl fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustStore")
            .field("certificates", &self.len())
            .finish()
    }
}
