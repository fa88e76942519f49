//! Per-test context and cleanup bookkeeping
//!
//! A [`TestContext`] owns everything one conformance test shares between
//! helpers: the API client, configuration, the test's name, its TLS trust
//! store and a registry of cleanups. Every create helper registers its
//! [`Cleanup`] here, so [`TestContext::teardown`] removes all objects even when
//! the caller dropped the handle.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use rand::distr::Alphanumeric;
use rand::Rng;
use rustls::pki_types::CertificateDer;
use tracing::{debug, error, info};

use crate::config::ConformanceConfig;
use crate::error::Result;
use crate::http::TrustStore;
use crate::k8s::{IngressManager, K8sClient, ResourceRef};

/// Longest DNS-1123 label
const MAX_NAME_LEN: usize = 63;
const RANDOM_SUFFIX_LEN: usize = 8;

/// Single undo action
#[derive(Clone, Debug)]
pub enum CleanupStep {
    /// Delete an object; already deleted is fine
    Delete(ResourceRef),

    /// Remove a CA certificate from a trust store
    Untrust {
        store: TrustStore,
        certificate: CertificateDer<'static>,
    },
}

impl PartialEq for CleanupStep {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CleanupStep::Delete(a), CleanupStep::Delete(b)) => a == b,
            (
                CleanupStep::Untrust {
                    store: a,
                    certificate: ca,
                },
                CleanupStep::Untrust {
                    store: b,
                    certificate: cb,
                },
            ) => a.same_store(b) && ca == cb,
            _ => false,
        }
    }
}

impl fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupStep::Delete(resource) => write!(f, "delete {resource}"),
            CleanupStep::Untrust { .. } => write!(f, "untrust certificate"),
        }
    }
}

/// Ordered undo actions for the objects one helper created
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Cleanup {
    steps: Vec<CleanupStep>,
}

impl Cleanup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delete(mut self, resource: ResourceRef) -> Self {
        self.steps.push(CleanupStep::Delete(resource));
        self
    }

    pub fn untrust(mut self, store: TrustStore, certificate: CertificateDer<'static>) -> Self {
        self.steps.push(CleanupStep::Untrust { store, certificate });
        self
    }

    /// Append the steps of `other` after these
    pub fn then(mut self, other: Cleanup) -> Self {
        self.steps.extend(other.steps);
        self
    }

    pub fn steps(&self) -> &[CleanupStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order and drop the registration from `ctx`
    ///
    /// All steps run even if one fails; the first failure is returned.
    pub async fn run(&self, ctx: &TestContext) -> Result<()> {
        let mut first_error = None;

        for step in &self.steps {
            if let Err(e) = run_step(ctx, step).await {
                error!(step = %step, error = %e, "Error cleaning up");
                first_error.get_or_insert(e);
            }
        }

        ctx.forget(self);
        first_error.map_or(Ok(()), Err)
    }
}

async fn run_step(ctx: &TestContext, step: &CleanupStep) -> Result<()> {
    match step {
        CleanupStep::Delete(resource) => ctx.client().delete(resource).await,
        CleanupStep::Untrust { store, certificate } => {
            if !store.remove(certificate) {
                debug!("Certificate already removed from trust store");
            }
            Ok(())
        }
    }
}

/// Everything one conformance test shares between helpers
pub struct TestContext {
    client: K8sClient,
    config: ConformanceConfig,
    test_name: String,
    trust: TrustStore,
    cleanups: Mutex<Vec<Cleanup>>,
}

impl TestContext {
    /// Create a context; API calls retry with the configured backoff
    pub fn new(client: K8sClient, config: ConformanceConfig, test_name: impl Into<String>) -> Self {
        let client = client.with_retry(config.api_retry.clone());
        Self {
            client,
            config,
            test_name: test_name.into(),
            trust: TrustStore::new(),
            cleanups: Mutex::new(Vec::new()),
        }
    }

    /// Use a caller-provided trust store instead of a fresh one
    pub fn with_trust_store(mut self, trust: TrustStore) -> Self {
        self.trust = trust;
        self
    }

    pub fn client(&self) -> &K8sClient {
        &self.client
    }

    pub fn config(&self) -> &ConformanceConfig {
        &self.config
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn trust_store(&self) -> &TrustStore {
        &self.trust
    }

    /// Manager for ingresses in the serving namespace
    pub fn ingresses(&self) -> IngressManager {
        IngressManager::new(self.client.clone(), &self.config.namespace)
    }

    /// Fresh object name derived from the test name
    pub fn object_name(&self) -> String {
        object_name_for_test(&self.test_name)
    }

    /// Remember `cleanup` for [`TestContext::teardown`]
    pub fn register(&self, cleanup: &Cleanup) {
        if cleanup.is_empty() {
            return;
        }
        self.cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(cleanup.clone());
    }

    fn forget(&self, cleanup: &Cleanup) {
        let mut cleanups = self.cleanups.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = cleanups.iter().rposition(|c| c == cleanup) {
            cleanups.remove(pos);
        }
    }

    /// Number of registered cleanups not yet run
    pub fn pending_cleanups(&self) -> usize {
        self.cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run every registered cleanup, newest first
    ///
    /// Returns the first failure after attempting all of them.
    pub async fn teardown(&self) -> Result<()> {
        let cleanups = std::mem::take(
            &mut *self.cleanups.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if cleanups.is_empty() {
            return Ok(());
        }
        info!(test = %self.test_name, count = cleanups.len(), "Tearing down");

        let mut first_error = None;
        for cleanup in cleanups.iter().rev() {
            for step in cleanup.steps() {
                if let Err(e) = run_step(self, step).await {
                    error!(step = %step, error = %e, "Error cleaning up");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("test_name", &self.test_name)
            .field("namespace", &self.config.namespace)
            .field("pending_cleanups", &self.pending_cleanups())
            .finish()
    }
}

/// Kebab-case prefix from a test name
///
/// A leading `Test` is dropped, every upper-case letter and every run of
/// non-alphanumeric characters starts a new `-` separated token.
pub fn object_prefix_for_test(test_name: &str) -> String {
    let name = test_name.strip_prefix("Test").unwrap_or(test_name);
    let mut prefix = String::with_capacity(name.len());
    let mut new_token = false;

    for c in name.chars() {
        if !c.is_ascii_alphanumeric() {
            new_token = true;
            continue;
        }
        if !prefix.is_empty() && (new_token || c.is_ascii_uppercase()) {
            prefix.push('-');
        }
        prefix.push(c.to_ascii_lowercase());
        new_token = false;
    }

    prefix
}

/// Unique DNS-1123 label for an object created by `test_name`
pub fn object_name_for_test(test_name: &str) -> String {
    let mut prefix = object_prefix_for_test(test_name);
    if prefix.is_empty() {
        prefix.push_str("test");
    }
    prefix.truncate(MAX_NAME_LEN - RANDOM_SUFFIX_LEN - 1);
    let prefix = prefix.trim_end_matches('-');

    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();

    format!("{prefix}-{suffix}")
}
