//! Knative Ingress resource management
//!
//! Typed `networking.internal.knative.dev/v1alpha1` Ingress, its defaulting
//! and validation rules, and the create / update / wait helpers conformance
//! tests are built from.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, PostParams};
use kube::core::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::client::{K8sClient, ResourceKind, ResourceRef};
use crate::context::{Cleanup, TestContext};
use crate::dial::{create_dial_context, DialContext};
use crate::error::{ConformanceError, Result};
use crate::http::HttpClient;
use crate::poll::{poll_until, ResourceState};
use crate::retry::retry_test_errors;
use crate::utils::timer::Timer;

/// Annotation selecting the ingress implementation that reconciles an Ingress
pub const INGRESS_CLASS_ANNOTATION: &str = "networking.knative.dev/ingress.class";

/// Condition type reported once the ingress is programmed
pub const READY_CONDITION: &str = "Ready";

/// Ingress custom resource specification
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[kube(
    group = "networking.internal.knative.dev",
    version = "v1alpha1",
    kind = "Ingress",
    namespaced,
    shortname = "kingress"
)]
#[kube(status = "IngressStatus")]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// TLS termination settings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tls: Vec<IngressTls>,

    /// Host-based routing rules
    #[serde(default)]
    pub rules: Vec<IngressRule>,

    /// Whether plain HTTP is served or redirected to HTTPS
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_option: Option<HttpOption>,
}

/// TLS certificate binding for a set of hosts
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressTls {
    #[serde(default)]
    pub hosts: Vec<String>,

    pub secret_name: String,

    pub secret_namespace: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub enum HttpOption {
    Enabled,
    Redirected,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub enum IngressVisibility {
    #[serde(rename = "ExternalIP")]
    ExternalIp,
    ClusterLocal,
}

/// Routing rule for a set of hosts
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<IngressVisibility>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpIngressRuleValue>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
pub struct HttpIngressRuleValue {
    #[serde(default)]
    pub paths: Vec<HttpIngressPath>,
}

/// Path match plus the weighted backends serving it
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpIngressPath {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Request headers that must match for this path to apply
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, HeaderMatch>,

    /// Host header sent to the backends instead of the original one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewrite_host: Option<String>,

    #[serde(default)]
    pub splits: Vec<IngressBackendSplit>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub append_headers: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
pub struct HeaderMatch {
    pub exact: String,
}

/// Weighted backend of a path
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressBackendSplit {
    pub service_namespace: String,

    pub service_name: String,

    pub service_port: IntOrString,

    /// Share of traffic; zero means unset
    #[serde(default, skip_serializing_if = "is_zero")]
    pub percent: i32,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub append_headers: BTreeMap<String, String>,
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

impl IngressBackendSplit {
    pub fn new(
        service_namespace: impl Into<String>,
        service_name: impl Into<String>,
        service_port: i32,
    ) -> Self {
        Self {
            service_namespace: service_namespace.into(),
            service_name: service_name.into(),
            service_port: IntOrString::Int(service_port),
            percent: 0,
            append_headers: BTreeMap::new(),
        }
    }

    pub fn with_percent(mut self, percent: i32) -> Self {
        self.percent = percent;
        self
    }

    pub fn with_append_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.append_headers.insert(key.into(), value.into());
        self
    }
}

/// Observed state of the ingress
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub conditions: Vec<IngressCondition>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_load_balancer: Option<LoadBalancerStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_load_balancer: Option<LoadBalancerStatus>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressCondition {
    #[serde(rename = "type")]
    pub condition_type: String,

    /// True, False or Unknown
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
pub struct LoadBalancerStatus {
    #[serde(default)]
    pub ingress: Vec<LoadBalancerIngressStatus>,
}

/// One load balancer entry; any of the address fields may be set
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerIngressStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// In-cluster service name of the load balancer (`name.namespace.svc...`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_internal: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub mesh_only: bool,
}

impl IngressSpec {
    /// Spec routing every request for `host` to a single backend
    pub fn single_backend(
        host: impl Into<String>,
        service_namespace: impl Into<String>,
        service_name: impl Into<String>,
        service_port: i32,
    ) -> Self {
        Self {
            rules: vec![IngressRule {
                hosts: vec![host.into()],
                visibility: Some(IngressVisibility::ExternalIp),
                http: Some(HttpIngressRuleValue {
                    paths: vec![HttpIngressPath {
                        splits: vec![IngressBackendSplit::new(
                            service_namespace,
                            service_name,
                            service_port,
                        )],
                        ..Default::default()
                    }],
                }),
            }],
            ..Default::default()
        }
    }

    pub fn with_tls(mut self, tls: IngressTls) -> Self {
        self.tls.push(tls);
        self
    }

    /// Fill the fields the API server would otherwise default
    pub fn set_defaults(&mut self) {
        if self.http_option.is_none() {
            self.http_option = Some(HttpOption::Enabled);
        }

        for rule in &mut self.rules {
            if rule.visibility.is_none() {
                rule.visibility = Some(IngressVisibility::ExternalIp);
            }
            let Some(http) = rule.http.as_mut() else {
                continue;
            };
            for path in &mut http.paths {
                if let [split] = path.splits.as_mut_slice() {
                    if split.percent == 0 {
                        split.percent = 100;
                    }
                }
            }
        }
    }

    /// Check the spec against the admission rules of the ingress webhook
    ///
    /// Every violation is collected and reported in a single error.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.rules.is_empty() {
            errors.push("missing field(s): spec.rules".to_string());
        }

        for (i, tls) in self.tls.iter().enumerate() {
            if tls.hosts.is_empty() {
                errors.push(format!("missing field(s): spec.tls[{i}].hosts"));
            }
            if tls.secret_name.is_empty() {
                errors.push(format!("missing field(s): spec.tls[{i}].secretName"));
            }
            if tls.secret_namespace.is_empty() {
                errors.push(format!("missing field(s): spec.tls[{i}].secretNamespace"));
            }
        }

        for (i, rule) in self.rules.iter().enumerate() {
            validate_rule(rule, &format!("spec.rules[{i}]"), &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConformanceError::InvalidIngress(errors.join("; ")))
        }
    }
}

fn validate_rule(rule: &IngressRule, field: &str, errors: &mut Vec<String>) {
    if rule.hosts.is_empty() {
        errors.push(format!("missing field(s): {field}.hosts"));
    }
    if rule.hosts.iter().any(|h| h.is_empty()) {
        errors.push(format!("invalid value: empty host in {field}.hosts"));
    }

    let Some(http) = &rule.http else {
        errors.push(format!("missing field(s): {field}.http"));
        return;
    };
    if http.paths.is_empty() {
        errors.push(format!("missing field(s): {field}.http.paths"));
    }

    for (i, path) in http.paths.iter().enumerate() {
        let field = format!("{field}.http.paths[{i}]");

        for (name, header) in &path.headers {
            if header.exact.is_empty() {
                errors.push(format!("missing field(s): {field}.headers[{name}].exact"));
            }
        }

        if path.splits.is_empty() {
            errors.push(format!("missing field(s): {field}.splits"));
            continue;
        }

        let mut total = 0;
        for (j, split) in path.splits.iter().enumerate() {
            let field = format!("{field}.splits[{j}]");
            if split.service_namespace.is_empty() {
                errors.push(format!("missing field(s): {field}.serviceNamespace"));
            }
            if split.service_name.is_empty() {
                errors.push(format!("missing field(s): {field}.serviceName"));
            }
            let port_missing = match &split.service_port {
                IntOrString::Int(port) => *port == 0,
                IntOrString::String(port) => port.is_empty(),
            };
            if port_missing {
                errors.push(format!("missing field(s): {field}.servicePort"));
            }
            if !(0..=100).contains(&split.percent) {
                errors.push(format!(
                    "expected 0 <= {} <= 100: {field}.percent",
                    split.percent
                ));
            }
            total += split.percent;
        }

        // A lone split may leave its percentage unset.
        if (path.splits.len() != 1 || total != 0) && total != 100 {
            errors.push(format!(
                "Traffic split percentage must total to 100, but was {total}: {field}.splits"
            ));
        }
    }
}

impl Ingress {
    /// Ready condition is True and the status reflects the current generation
    ///
    /// A status that has not reported an observed generation is never ready.
    pub fn is_ready(&self) -> bool {
        let Some(status) = &self.status else {
            return false;
        };

        let generation_observed = status.observed_generation.is_some()
            && status.observed_generation == self.metadata.generation;

        generation_observed
            && status
                .condition(READY_CONDITION)
                .map(|c| c.status == "True")
                .unwrap_or(false)
    }

    /// First entry of the public load balancer, if one was assigned
    pub fn public_load_balancer(&self) -> Option<&LoadBalancerIngressStatus> {
        self.status
            .as_ref()
            .and_then(|s| s.public_load_balancer.as_ref())
            .and_then(|lb| lb.ingress.first())
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}

impl IngressStatus {
    pub fn condition(&self, condition_type: &str) -> Option<&IngressCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

impl fmt::Display for IngressCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.condition_type, self.status)?;
        match (&self.reason, &self.message) {
            (Some(reason), Some(message)) => write!(f, " ({reason}: {message})"),
            (Some(reason), None) => write!(f, " ({reason})"),
            (None, Some(message)) => write!(f, " ({message})"),
            (None, None) => Ok(()),
        }
    }
}

impl ResourceState for Ingress {
    fn state_description(&self) -> String {
        let generation = self
            .metadata
            .generation
            .map(|g| g.to_string())
            .unwrap_or_else(|| "-".to_string());

        let Some(status) = &self.status else {
            return format!("generation={generation}, no status");
        };

        let observed = status
            .observed_generation
            .map(|g| g.to_string())
            .unwrap_or_else(|| "-".to_string());
        let conditions = if status.conditions.is_empty() {
            "no conditions".to_string()
        } else {
            status
                .conditions
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        let lb = status
            .public_load_balancer
            .as_ref()
            .map(|lb| format!("{} public LB entries", lb.ingress.len()))
            .unwrap_or_else(|| "no public LB".to_string());

        format!("generation={generation}, observedGeneration={observed}, {conditions}, {lb}")
    }
}

/// Predicate for [`wait_for_ingress_state`] waiting on readiness
pub fn is_ingress_ready(ingress: &Ingress) -> Result<bool> {
    Ok(ingress.is_ready())
}

/// Ingress resource manager
pub struct IngressManager {
    client: K8sClient,
    namespace: String,
}

impl IngressManager {
    pub fn new(client: K8sClient, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api(&self) -> Api<Ingress> {
        self.client.namespaced_api(&self.namespace)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Get an ingress by name
    pub async fn get(&self, name: &str) -> Result<Ingress> {
        let api = self.api();
        retry_test_errors(self.client.retry(), "get ingress", |_| async {
            api.get(name).await.map_err(ConformanceError::from)
        })
        .await
    }

    /// Create an ingress
    pub async fn create(&self, ingress: &Ingress) -> Result<Ingress> {
        let api = self.api();
        let created = retry_test_errors(self.client.retry(), "create ingress", |attempt| {
            let api = &api;
            async move {
                if attempt > 0 {
                    debug!(name = %ingress.name(), attempt, "Retrying ingress creation");
                }
                api.create(&PostParams::default(), ingress)
                    .await
                    .map_err(ConformanceError::from)
            }
        })
        .await?;

        info!(namespace = %self.namespace, name = %created.name(), "Created ingress");
        Ok(created)
    }

    /// Replace the spec of an existing ingress
    ///
    /// Each attempt refetches the object so a conflict is retried against the
    /// latest resource version.
    pub async fn update_spec(&self, name: &str, spec: &IngressSpec) -> Result<Ingress> {
        let api = self.api();
        let updated = retry_test_errors(self.client.retry(), "update ingress", |_| {
            let api = &api;
            async move {
                let mut ingress = self.get(name).await?;
                ingress.spec = spec.clone();
                ingress.spec.validate()?;
                api.replace(name, &PostParams::default(), &ingress)
                    .await
                    .map_err(ConformanceError::from)
            }
        })
        .await?;

        info!(namespace = %self.namespace, name = %name, "Updated ingress");
        Ok(updated)
    }

    /// Poll the ingress until `in_state` accepts it
    ///
    /// A missing ingress counts as "not there yet". `desc` names the wait in
    /// the timing log line.
    pub async fn wait_for_state<P>(
        &self,
        name: &str,
        in_state: P,
        desc: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Ingress>
    where
        P: FnMut(&Ingress) -> Result<bool>,
    {
        let timer = Timer::start(format!("WaitForIngressState/{name}/{desc}"));

        let result = poll_until(interval, timeout, || self.get(name), in_state).await;
        let elapsed = timer.stop();

        match result {
            Ok(ingress) => {
                info!(name = %name, desc = %desc, elapsed_ms = elapsed.as_millis() as u64, "Ingress in desired state");
                Ok(ingress)
            }
            Err(e) => {
                warn!(name = %name, desc = %desc, error = %e, "Ingress did not reach desired state");
                Err(e.into_wait_error(format!("ingress {name:?}")))
            }
        }
    }
}

/// Wait for the ingress `name` in the serving namespace to satisfy `in_state`
pub async fn wait_for_ingress_state<P>(
    ctx: &TestContext,
    name: &str,
    in_state: P,
    desc: &str,
) -> Result<Ingress>
where
    P: FnMut(&Ingress) -> Result<bool>,
{
    let config = ctx.config();
    ctx.ingresses()
        .wait_for_state(
            name,
            in_state,
            desc,
            config.poll_interval(),
            config.poll_timeout(),
        )
        .await
}

/// Create an ingress with a generated name in the serving namespace
pub async fn create_ingress(ctx: &TestContext, mut spec: IngressSpec) -> Result<(Ingress, Cleanup)> {
    let config = ctx.config();
    let name = ctx.object_name();

    let mut ingress = Ingress::new(&name, IngressSpec::default());
    ingress.metadata = ObjectMeta {
        name: Some(name.clone()),
        namespace: Some(config.namespace.clone()),
        annotations: Some(BTreeMap::from([(
            INGRESS_CLASS_ANNOTATION.to_string(),
            config.ingress_class.clone(),
        )])),
        ..Default::default()
    };

    spec.set_defaults();
    spec.validate()?;
    ingress.spec = spec;

    let cleanup = Cleanup::new().delete(ResourceRef::new(
        ResourceKind::Ingress,
        &config.namespace,
        &name,
    ));
    ctx.register(&cleanup);

    let created = ctx.ingresses().create(&ingress).await?;
    Ok((created, cleanup))
}

/// Create an ingress, wait until it is ready and build a dialer for its
/// public load balancer
pub async fn create_ingress_ready_dial_context(
    ctx: &TestContext,
    spec: IngressSpec,
) -> Result<(Ingress, DialContext, Cleanup)> {
    let (ingress, cleanup) = create_ingress(ctx, spec).await?;
    let name = ingress.name().to_string();

    let ready = async {
        wait_for_ingress_state(ctx, &name, is_ingress_ready, ctx.test_name()).await?;
        let ingress = ctx.ingresses().get(&name).await?;
        let dialer = create_dial_context(ctx.client(), &ingress, ctx.config()).await?;
        Ok::<_, ConformanceError>((ingress, dialer))
    };

    match ready.await {
        Ok((ingress, dialer)) => Ok((ingress, dialer, cleanup)),
        Err(e) => {
            if let Err(cleanup_err) = cleanup.run(ctx).await {
                warn!(name = %name, error = %cleanup_err, "Cleanup after failed readiness wait failed");
            }
            Err(e)
        }
    }
}

/// Create a ready ingress and an HTTP client bound to its load balancer
///
/// The client trusts the context's certificates when the spec carries TLS
/// entries.
pub async fn create_ingress_ready(
    ctx: &TestContext,
    spec: IngressSpec,
) -> Result<(Ingress, HttpClient, Cleanup)> {
    let (ingress, dialer, cleanup) = create_ingress_ready_dial_context(ctx, spec).await?;

    let trust = (!ingress.spec.tls.is_empty()).then(|| ctx.trust_store());
    let client = HttpClient::new(dialer, trust)?
        .with_user_agent(format!("knative.dev/{}/{}", ctx.test_name(), ingress.name()))
        .with_timeout(ctx.config().request_timeout());

    Ok((ingress, client, cleanup))
}

/// Replace the spec of the named ingress
pub async fn update_ingress(ctx: &TestContext, name: &str, spec: &IngressSpec) -> Result<Ingress> {
    ctx.ingresses().update_spec(name, spec).await
}

/// Replace the spec of the named ingress and wait until it is ready again
pub async fn update_ingress_ready(
    ctx: &TestContext,
    name: &str,
    spec: &IngressSpec,
) -> Result<Ingress> {
    update_ingress(ctx, name, spec).await?;
    wait_for_ingress_state(ctx, name, is_ingress_ready, ctx.test_name()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::fake::{deleted, not_found, status_error, FakeApiServer, INGRESSES};
    use serde_json::json;

    fn ingress_with_status(generation: Option<i64>, status: IngressStatus) -> Ingress {
        let mut ingress = Ingress::new("foo", IngressSpec::default());
        ingress.metadata.generation = generation;
        ingress.status = Some(status);
        ingress
    }

    fn ready(status: &str) -> IngressCondition {
        IngressCondition {
            condition_type: READY_CONDITION.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_is_ready() {
        let status = IngressStatus {
            observed_generation: Some(2),
            conditions: vec![ready("True")],
            ..Default::default()
        };
        assert!(ingress_with_status(Some(2), status.clone()).is_ready());
        assert!(!ingress_with_status(Some(3), status).is_ready());

        let unknown = IngressStatus {
            conditions: vec![ready("Unknown")],
            ..Default::default()
        };
        assert!(!ingress_with_status(Some(1), unknown).is_ready());
        assert!(!Ingress::new("foo", IngressSpec::default()).is_ready());
    }

    #[test]
    fn test_not_ready_without_observed_generation() {
        let status = IngressStatus {
            conditions: vec![ready("True")],
            ..Default::default()
        };
        assert!(!ingress_with_status(Some(1), status.clone()).is_ready());
        assert!(!ingress_with_status(None, status).is_ready());

        let observed = IngressStatus {
            observed_generation: Some(1),
            conditions: vec![ready("True")],
            ..Default::default()
        };
        assert!(!ingress_with_status(None, observed).is_ready());
    }

    #[test]
    fn test_set_defaults() {
        let mut spec = IngressSpec::single_backend("foo.example.com", "ns", "svc", 80);
        spec.rules[0].visibility = None;
        spec.set_defaults();

        assert_eq!(spec.http_option, Some(HttpOption::Enabled));
        assert_eq!(spec.rules[0].visibility, Some(IngressVisibility::ExternalIp));
        let split = &spec.rules[0].http.as_ref().unwrap().paths[0].splits[0];
        assert_eq!(split.percent, 100);
    }

    #[test]
    fn test_set_defaults_leaves_multiple_splits_alone() {
        let mut spec = IngressSpec::single_backend("foo.example.com", "ns", "a", 80);
        let path = &mut spec.rules[0].http.as_mut().unwrap().paths[0];
        path.splits[0].percent = 30;
        path.splits.push(IngressBackendSplit::new("ns", "b", 80).with_percent(70));
        spec.set_defaults();

        let splits = &spec.rules[0].http.as_ref().unwrap().paths[0].splits;
        assert_eq!(splits[0].percent, 30);
        assert_eq!(splits[1].percent, 70);
    }

    #[test]
    fn test_validate_accepts_single_backend() {
        let spec = IngressSpec::single_backend("foo.example.com", "ns", "svc", 80);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_split_totals() {
        let mut spec = IngressSpec::single_backend("foo.example.com", "ns", "a", 80);
        let path = &mut spec.rules[0].http.as_mut().unwrap().paths[0];
        path.splits[0].percent = 30;
        path.splits.push(IngressBackendSplit::new("ns", "b", 80).with_percent(30));

        let err = spec.validate().unwrap_err();
        assert!(matches!(err, ConformanceError::InvalidIngress(_)));
        assert!(err.to_string().contains("must total to 100, but was 60"));
    }

    #[test]
    fn test_validate_collects_every_violation() {
        let spec = IngressSpec {
            tls: vec![IngressTls::default()],
            rules: vec![IngressRule::default()],
            http_option: None,
        };
        let message = spec.validate().unwrap_err().to_string();

        assert!(message.contains("spec.tls[0].hosts"));
        assert!(message.contains("spec.tls[0].secretName"));
        assert!(message.contains("spec.rules[0].hosts"));
        assert!(message.contains("spec.rules[0].http"));

        assert!(IngressSpec::default().validate().is_err());
    }

    #[test]
    fn test_serialization_uses_knative_field_names() {
        let spec = IngressSpec::single_backend("foo.example.com", "ns", "svc", 80).with_tls(
            IngressTls {
                hosts: vec!["foo.example.com".to_string()],
                secret_name: "cert".to_string(),
                secret_namespace: "ns".to_string(),
            },
        );
        let value = serde_json::to_value(&spec).unwrap();

        assert_eq!(value["rules"][0]["visibility"], "ExternalIP");
        assert_eq!(value["tls"][0]["secretName"], "cert");
        let split = &value["rules"][0]["http"]["paths"][0]["splits"][0];
        assert_eq!(split["serviceName"], "svc");
        assert_eq!(split["servicePort"], 80);
        assert!(split.get("percent").is_none());
    }

    #[test]
    fn test_status_deserialization() {
        let ingress: Ingress = serde_json::from_value(json!({
            "apiVersion": "networking.internal.knative.dev/v1alpha1",
            "kind": "Ingress",
            "metadata": { "name": "foo", "namespace": "serving-tests", "generation": 1 },
            "spec": { "rules": [] },
            "status": {
                "observedGeneration": 1,
                "conditions": [
                    { "type": "LoadBalancerReady", "status": "True" },
                    { "type": "Ready", "status": "True" }
                ],
                "publicLoadBalancer": {
                    "ingress": [{ "domainInternal": "istio-ingressgateway.istio-system.svc.cluster.local" }]
                }
            }
        }))
        .unwrap();

        assert!(ingress.is_ready());
        assert_eq!(
            ingress.public_load_balancer().unwrap().domain_internal.as_deref(),
            Some("istio-ingressgateway.istio-system.svc.cluster.local")
        );
    }

    #[test]
    fn test_state_description() {
        let status = IngressStatus {
            observed_generation: Some(1),
            conditions: vec![IngressCondition {
                reason: Some("Uninitialized".to_string()),
                message: Some("Waiting for load balancer".to_string()),
                ..ready("Unknown")
            }],
            ..Default::default()
        };
        let description = ingress_with_status(Some(2), status).state_description();

        assert!(description.contains("generation=2"));
        assert!(description.contains("observedGeneration=1"));
        assert!(description.contains("Ready=Unknown (Uninitialized: Waiting for load balancer)"));
        assert!(description.contains("no public LB"));
    }

    fn stored_ingress(host: &str, resource_version: u32) -> serde_json::Value {
        let mut ingress = Ingress::new("foo", IngressSpec::single_backend(host, "serving-tests", "svc", 80));
        ingress.metadata.namespace = Some("serving-tests".to_string());
        ingress.metadata.resource_version = Some(resource_version.to_string());
        serde_json::to_value(&ingress).unwrap()
    }

    #[tokio::test]
    async fn test_create_ingress_sets_class_and_defaults() {
        let server = FakeApiServer::start(|req| match req.method.as_str() {
            "POST" => (201, req.body.clone().unwrap_or_default()),
            "DELETE" => deleted(
                "networking.internal.knative.dev/v1alpha1",
                "Ingress",
                req.path.rsplit('/').next().unwrap_or_default(),
            ),
            _ => not_found("unexpected"),
        })
        .await;
        let ctx = server.context("TestCreateIngress");

        let mut spec = IngressSpec::single_backend("foo.example.com", "serving-tests", "svc", 80);
        spec.rules[0].visibility = None;
        let split = &mut spec.rules[0].http.as_mut().unwrap().paths[0].splits[0];
        *split = split.clone().with_append_header("Foo", "bar");

        let (created, cleanup) = create_ingress(&ctx, spec).await.unwrap();
        assert!(created.name().starts_with("create-ingress"));
        assert_eq!(ctx.pending_cleanups(), 1);

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].is("POST", INGRESSES));
        let body = requests[0].body.as_ref().unwrap();
        assert_eq!(
            body["metadata"]["annotations"][INGRESS_CLASS_ANNOTATION],
            "istio.ingress.networking.knative.dev"
        );
        assert_eq!(body["metadata"]["namespace"], "serving-tests");
        assert_eq!(body["spec"]["httpOption"], "Enabled");
        let rule = &body["spec"]["rules"][0];
        assert_eq!(rule["visibility"], "ExternalIP");
        let split = &rule["http"]["paths"][0]["splits"][0];
        assert_eq!(split["percent"], 100);
        assert_eq!(split["appendHeaders"]["Foo"], "bar");

        cleanup.run(&ctx).await.unwrap();
        let (method, path) = server.calls().pop().unwrap();
        assert_eq!(method, "DELETE");
        assert_eq!(path, format!("{INGRESSES}/{}", created.name()));
        assert_eq!(ctx.pending_cleanups(), 0);
    }

    #[tokio::test]
    async fn test_create_ingress_rejects_invalid_spec_before_calling_api() {
        let server = FakeApiServer::start(|req| (201, req.body.clone().unwrap_or_default())).await;
        let ctx = server.context("TestCreateIngress");

        let err = create_ingress(&ctx, IngressSpec::default()).await.unwrap_err();
        assert!(matches!(err, ConformanceError::InvalidIngress(_)));
        assert!(server.requests().is_empty());
        assert_eq!(ctx.pending_cleanups(), 0);
    }

    #[tokio::test]
    async fn test_update_spec_refetches_after_conflict() {
        let mut gets = 0;
        let mut puts = 0;
        let server = FakeApiServer::start(move |req| match req.method.as_str() {
            "GET" => {
                gets += 1;
                (200, stored_ingress("old.example.com", gets))
            }
            "PUT" => {
                puts += 1;
                if puts == 1 {
                    status_error(409, "Conflict", "the object has been modified")
                } else {
                    (200, req.body.clone().unwrap_or_default())
                }
            }
            _ => not_found("unexpected"),
        })
        .await;
        let ctx = server.context("TestUpdate");

        let spec = IngressSpec::single_backend("new.example.com", "serving-tests", "svc", 80);
        let updated = update_ingress(&ctx, "foo", &spec).await.unwrap();
        assert_eq!(updated.spec.rules[0].hosts, vec!["new.example.com".to_string()]);

        let path = format!("{INGRESSES}/foo");
        let expected: Vec<_> = ["GET", "PUT", "GET", "PUT"]
            .iter()
            .map(|method| (method.to_string(), path.clone()))
            .collect();
        assert_eq!(server.calls(), expected);

        let last_put = server.requests().pop().unwrap().body.unwrap();
        assert_eq!(last_put["metadata"]["resourceVersion"], "2");
        assert_eq!(last_put["spec"]["rules"][0]["hosts"][0], "new.example.com");
    }

    #[tokio::test]
    async fn test_wait_for_ingress_state_tolerates_missing_ingress() {
        let mut gets = 0;
        let server = FakeApiServer::start(move |_| {
            gets += 1;
            if gets <= 2 {
                return not_found("foo");
            }
            let mut ingress = Ingress::new("foo", IngressSpec::default());
            ingress.metadata.generation = Some(1);
            ingress.status = Some(IngressStatus {
                observed_generation: Some(1),
                conditions: vec![ready(if gets == 3 { "Unknown" } else { "True" })],
                ..Default::default()
            });
            (200, serde_json::to_value(&ingress).unwrap())
        })
        .await;
        let ctx = server.context("TestWait");

        let ingress = wait_for_ingress_state(&ctx, "foo", is_ingress_ready, "ready")
            .await
            .unwrap();
        assert!(ingress.is_ready());

        let requests = server.requests();
        assert_eq!(requests.len(), 4);
        let path = format!("{INGRESSES}/foo");
        assert!(requests.iter().all(|r| r.is("GET", &path)));
    }

    #[tokio::test]
    async fn test_wait_for_state_times_out_when_never_created() {
        let server = FakeApiServer::start(|_| not_found("foo")).await;
        let ctx = server.context("TestWait");

        let err = ctx
            .ingresses()
            .wait_for_state(
                "foo",
                is_ingress_ready,
                "ready",
                Duration::from_millis(10),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();

        match err {
            ConformanceError::WaitTimeout { resource, last_state, .. } => {
                assert_eq!(resource, "ingress \"foo\"");
                assert_eq!(last_state, "no state observed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
