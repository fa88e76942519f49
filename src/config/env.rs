//! Environment variable configuration
//!
//! Every setting can be overridden with an `INGRESS_CONFORMANCE_*` variable.
//! The image registry also honours `KO_DOCKER_REPO`, the variable the test
//! images are published with.

use std::env;

/// Environment variable prefix
const ENV_PREFIX: &str = "INGRESS_CONFORMANCE";

/// Registry the test images were pushed to
const KO_DOCKER_REPO: &str = "KO_DOCKER_REPO";

/// Configuration overrides read from the environment
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnvConfig {
    /// INGRESS_CONFORMANCE_NAMESPACE
    pub namespace: Option<String>,
    /// INGRESS_CONFORMANCE_INGRESS_CLASS
    pub ingress_class: Option<String>,
    /// INGRESS_CONFORMANCE_INGRESS_ENDPOINT
    pub ingress_endpoint: Option<String>,
    /// KO_DOCKER_REPO
    pub image_repo: Option<String>,
    /// INGRESS_CONFORMANCE_IMAGE_TAG
    pub image_tag: Option<String>,
    /// INGRESS_CONFORMANCE_POLL_INTERVAL_MS
    pub poll_interval_ms: Option<u64>,
    /// INGRESS_CONFORMANCE_POLL_TIMEOUT_SECS
    pub poll_timeout_secs: Option<u64>,
    /// INGRESS_CONFORMANCE_REQUEST_TIMEOUT_SECS
    pub request_timeout_secs: Option<u64>,
    /// INGRESS_CONFORMANCE_VERBOSE
    pub verbose: Option<bool>,
    /// INGRESS_CONFORMANCE_CONFIG
    pub config_file: Option<String>,
    /// KUBECONFIG
    pub kubeconfig: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            namespace: get_env("NAMESPACE"),
            ingress_class: get_env("INGRESS_CLASS"),
            ingress_endpoint: get_env("INGRESS_ENDPOINT"),
            image_repo: env::var(KO_DOCKER_REPO).ok().filter(|v| !v.is_empty()),
            image_tag: get_env("IMAGE_TAG"),
            poll_interval_ms: get_env_parse("POLL_INTERVAL_MS"),
            poll_timeout_secs: get_env_parse("POLL_TIMEOUT_SECS"),
            request_timeout_secs: get_env_parse("REQUEST_TIMEOUT_SECS"),
            verbose: get_env_bool("VERBOSE"),
            config_file: get_env("CONFIG"),
            kubeconfig: env::var("KUBECONFIG").ok(),
        }
    }

    /// Check if any override is set
    pub fn has_any(&self) -> bool {
        self.namespace.is_some()
            || self.ingress_class.is_some()
            || self.ingress_endpoint.is_some()
            || self.image_repo.is_some()
            || self.image_tag.is_some()
            || self.poll_interval_ms.is_some()
            || self.poll_timeout_secs.is_some()
            || self.request_timeout_secs.is_some()
            || self.verbose.is_some()
            || self.config_file.is_some()
    }

    /// Print current environment configuration
    pub fn print_summary(&self) {
        println!("Environment Configuration:");
        println!("  {ENV_PREFIX}_NAMESPACE:            {:?}", self.namespace);
        println!("  {ENV_PREFIX}_INGRESS_CLASS:        {:?}", self.ingress_class);
        println!("  {ENV_PREFIX}_INGRESS_ENDPOINT:     {:?}", self.ingress_endpoint);
        println!("  {ENV_PREFIX}_IMAGE_TAG:            {:?}", self.image_tag);
        println!("  {ENV_PREFIX}_POLL_INTERVAL_MS:     {:?}", self.poll_interval_ms);
        println!("  {ENV_PREFIX}_POLL_TIMEOUT_SECS:    {:?}", self.poll_timeout_secs);
        println!("  {ENV_PREFIX}_REQUEST_TIMEOUT_SECS: {:?}", self.request_timeout_secs);
        println!("  {ENV_PREFIX}_VERBOSE:              {:?}", self.verbose);
        println!("  {ENV_PREFIX}_CONFIG:               {:?}", self.config_file);
        println!("  {KO_DOCKER_REPO}:                           {:?}", self.image_repo);
        println!("  KUBECONFIG:                               {:?}", self.kubeconfig);
    }
}

fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}"))
        .ok()
        .filter(|v| !v.is_empty())
}

fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Builder for setting environment variables in tests
#[derive(Default)]
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn prefixed(mut self, name: &str, value: String) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_{name}"), value));
        self
    }

    pub fn namespace(self, namespace: impl Into<String>) -> Self {
        self.prefixed("NAMESPACE", namespace.into())
    }

    pub fn ingress_class(self, class: impl Into<String>) -> Self {
        self.prefixed("INGRESS_CLASS", class.into())
    }

    pub fn ingress_endpoint(self, endpoint: impl Into<String>) -> Self {
        self.prefixed("INGRESS_ENDPOINT", endpoint.into())
    }

    pub fn image_repo(mut self, repo: impl Into<String>) -> Self {
        self.vars.push((KO_DOCKER_REPO.to_string(), repo.into()));
        self
    }

    pub fn poll_timeout_secs(self, secs: u64) -> Self {
        self.prefixed("POLL_TIMEOUT_SECS", secs.to_string())
    }

    pub fn verbose(self, verbose: bool) -> Self {
        self.prefixed("VERBOSE", verbose.to_string())
    }

    /// Apply environment variables
    pub fn apply(self) {
        for (key, value) in self.vars {
            env::set_var(key, value);
        }
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        self.apply();

        EnvGuard { previous }
    }
}

/// Guard that restores environment variables on drop
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}

/// Print every recognised environment variable
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {ENV_PREFIX}_NAMESPACE            Namespace for test resources");
    println!("  {ENV_PREFIX}_INGRESS_CLASS        Ingress class annotation value");
    println!("  {ENV_PREFIX}_INGRESS_ENDPOINT     Dial this host's node ports instead of the load balancer");
    println!("  {ENV_PREFIX}_IMAGE_TAG            Tag of the test images");
    println!("  {ENV_PREFIX}_POLL_INTERVAL_MS     Interval between readiness checks");
    println!("  {ENV_PREFIX}_POLL_TIMEOUT_SECS    Give up waiting after this many seconds");
    println!("  {ENV_PREFIX}_REQUEST_TIMEOUT_SECS Timeout of a single probe request");
    println!("  {ENV_PREFIX}_VERBOSE              Enable debug logging (true/false)");
    println!("  {ENV_PREFIX}_CONFIG               Path to configuration file");
    println!("  {KO_DOCKER_REPO}                       Registry holding the test images");
    println!("  KUBECONFIG                           Path to kubeconfig file");
    println!();
    println!("Example:");
    println!("  export {KO_DOCKER_REPO}=gcr.io/my-project");
    println!("  export {ENV_PREFIX}_INGRESS_CLASS=kourier.ingress.networking.knative.dev");
    println!("  ingress-conformance smoke");
}
