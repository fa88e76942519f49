//! Kubernetes client wrapper
//!
//! Provides a high-level interface to the Kubernetes API.

use std::fmt;

use k8s_openapi::api::core::v1::{Namespace, Pod, Secret, Service};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, DeleteParams},
    Client, Config,
};
use tracing::{debug, info, warn};

use super::ingress::Ingress;
use crate::error::{ConformanceError, Result};
use crate::retry::{retry_test_errors, BackoffConfig};

/// CRD backing the ingress resource under test
pub const INGRESS_CRD_NAME: &str = "ingresses.networking.internal.knative.dev";

/// Kubernetes client wrapper
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
    retry: BackoffConfig,
}

impl K8sClient {
    /// Create a new Kubernetes client from the ambient kubeconfig
    pub async fn new() -> Result<Self> {
        let client = Client::try_default().await?;

        Ok(Self::from_client(client))
    }

    /// Create client with custom config
    pub fn with_config(config: Config) -> Result<Self> {
        let client = Client::try_from(config)?;

        Ok(Self::from_client(client))
    }

    /// Wrap an existing kube client
    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            retry: BackoffConfig::api(),
        }
    }

    /// Override the backoff used around API calls
    pub fn with_retry(mut self, retry: BackoffConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Get the underlying kube client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Backoff applied by [`retry_test_errors`] around API calls
    pub fn retry(&self) -> &BackoffConfig {
        &self.retry
    }

    /// Create a namespaced API for any resource type
    pub fn namespaced_api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Check if the ingress CRD is installed
    pub async fn ingress_crd_installed(&self) -> Result<bool> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());

        match crds.get(INGRESS_CRD_NAME).await {
            Ok(_) => {
                info!("Ingress CRD {} is installed", INGRESS_CRD_NAME);
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                warn!("Ingress CRD {} not installed", INGRESS_CRD_NAME);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check if namespace exists
    pub async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());

        match namespaces.get(name).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the referenced object, treating "already gone" as success
    pub async fn delete(&self, resource: &ResourceRef) -> Result<()> {
        let label = resource.to_string();
        let result = match resource.kind {
            ResourceKind::Pod => self.delete_as::<Pod>(resource, &label).await,
            ResourceKind::Service => self.delete_as::<Service>(resource, &label).await,
            ResourceKind::Secret => self.delete_as::<Secret>(resource, &label).await,
            ResourceKind::Ingress => self.delete_as::<Ingress>(resource, &label).await,
        };

        match result {
            Err(e) if e.is_not_found() => {
                debug!(resource = %label, "Already deleted");
                Ok(())
            }
            other => other,
        }
    }

    async fn delete_as<K>(&self, resource: &ResourceRef, label: &str) -> Result<()>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>
            + Clone
            + fmt::Debug
            + serde::de::DeserializeOwned,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.namespaced_api(&resource.namespace);
        retry_test_errors(&self.retry, label, |_| async {
            api.delete(&resource.name, &DeleteParams::default())
                .await
                .map(|_| ())
                .map_err(ConformanceError::from)
        })
        .await?;

        debug!(resource = %label, "Deleted");
        Ok(())
    }
}

/// Kinds of objects the helpers create
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Pod,
    Service,
    Secret,
    Ingress,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Pod => "pod",
            ResourceKind::Service => "service",
            ResourceKind::Secret => "secret",
            ResourceKind::Ingress => "ingress",
        };
        f.write_str(name)
    }
}

/// (kind, namespace, name) of a created object
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}
