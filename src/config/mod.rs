//! Configuration module
//!
//! Settings are resolved from built-in defaults, then a config file, then
//! `INGRESS_CONFORMANCE_*` environment variables. CLI flags are applied last
//! by the binary.

pub mod env;
pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dial::check_endpoint_host;
use crate::error::{ConformanceError, Result};
use crate::retry::BackoffConfig;

pub use env::{EnvBuilder, EnvConfig, EnvGuard};
pub use file::ConfigFile;

/// Settings shared by every conformance helper
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConformanceConfig {
    /// Namespace holding backends, secrets and ingresses
    pub namespace: String,

    /// Value of the ingress class annotation
    pub ingress_class: String,

    /// Host to dial on the Service's node ports instead of the load balancer
    pub ingress_endpoint: Option<String>,

    /// Registry prefix of the test images
    pub image_repo: String,

    /// Tag of the test images
    pub image_tag: String,

    pub poll_interval_ms: u64,
    pub poll_timeout_secs: u64,

    /// Per-request timeout of probe requests
    pub request_timeout_secs: u64,

    /// Backoff for dialing a load balancer that is still coming up
    pub dial_backoff: BackoffConfig,

    /// Backoff for transient API errors
    pub api_retry: BackoffConfig,
}

impl Default for ConformanceConfig {
    fn default() -> Self {
        Self {
            namespace: "serving-tests".to_string(),
            ingress_class: "istio.ingress.networking.knative.dev".to_string(),
            ingress_endpoint: None,
            image_repo: "ko.local".to_string(),
            image_tag: "latest".to_string(),
            poll_interval_ms: 1000,
            poll_timeout_secs: 600,
            request_timeout_secs: 30,
            dial_backoff: BackoffConfig::dial(),
            api_retry: BackoffConfig::api(),
        }
    }
}

impl ConformanceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Fully qualified reference of the test image `name`
    pub fn image_path(&self, name: &str) -> String {
        format!("{}/{}:{}", self.image_repo, name, self.image_tag)
    }

    /// Check the settings are usable
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(ConformanceError::Config("namespace must not be empty".to_string()));
        }
        if self.ingress_class.is_empty() {
            return Err(ConformanceError::Config(
                "ingress class must not be empty".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConformanceError::Config(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        if self.poll_timeout() < self.poll_interval() {
            return Err(ConformanceError::Config(format!(
                "poll timeout ({}s) is shorter than the poll interval ({}ms)",
                self.poll_timeout_secs, self.poll_interval_ms
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConformanceError::Config(
                "request timeout must be greater than zero".to_string(),
            ));
        }
        if let Some(endpoint) = self.ingress_endpoint.as_deref().filter(|e| !e.is_empty()) {
            check_endpoint_host(endpoint)?;
        }
        self.dial_backoff
            .validate()
            .map_err(|e| ConformanceError::Config(format!("dial backoff: {e}")))?;
        self.api_retry
            .validate()
            .map_err(|e| ConformanceError::Config(format!("api retry: {e}")))?;
        Ok(())
    }

    /// Override fields set in the environment
    pub fn apply_env(&mut self, env: &EnvConfig) {
        if let Some(namespace) = &env.namespace {
            self.namespace = namespace.clone();
        }
        if let Some(class) = &env.ingress_class {
            self.ingress_class = class.clone();
        }
        if let Some(endpoint) = &env.ingress_endpoint {
            self.ingress_endpoint = Some(endpoint.clone());
        }
        if let Some(repo) = &env.image_repo {
            self.image_repo = repo.clone();
        }
        if let Some(tag) = &env.image_tag {
            self.image_tag = tag.clone();
        }
        if let Some(interval) = env.poll_interval_ms {
            self.poll_interval_ms = interval;
        }
        if let Some(timeout) = env.poll_timeout_secs {
            self.poll_timeout_secs = timeout;
        }
        if let Some(timeout) = env.request_timeout_secs {
            self.request_timeout_secs = timeout;
        }
    }

    /// Resolve the configuration for a run
    ///
    /// `path` wins over `INGRESS_CONFORMANCE_CONFIG`, which wins over the
    /// standard locations. Returns the file that was read, if any.
    pub fn resolve(path: Option<&Path>, env: &EnvConfig) -> anyhow::Result<(Self, Option<PathBuf>)> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env.config_file.as_deref().map(file::expand_path))
            .or_else(ConfigFile::find);

        let mut config = match &path {
            Some(path) => {
                debug!(path = %path.display(), "Loading configuration file");
                ConfigFile::load(path)?.conformance
            }
            None => Self::default(),
        };

        config.apply_env(env);
        config.validate().context("Invalid configuration")?;
        Ok((config, path))
    }
}
