//! Backend workloads for ingress tests
//!
//! Each creator starts one pod running a test image behind a ClusterIP
//! service, waits until the pod shows up in the service's endpoints and
//! returns the service name, the service port and a [`Cleanup`].

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Endpoints, HTTPGetAction, Pod, PodSpec, Probe, Service,
    ServicePort, ServiceSpec, TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, PostParams};
use kube::core::ObjectMeta;
use rand::Rng;
use tracing::{debug, info};

use super::client::{ResourceKind, ResourceRef};
use crate::config::ConformanceConfig;
use crate::context::{Cleanup, TestContext};
use crate::error::{ConformanceError, Result};
use crate::poll::{poll_until, ResourceState};
use crate::retry::retry_test_errors;

/// Port name for plain HTTP/1 backends
pub const PORT_NAME_HTTP1: &str = "http";
/// Port name for cleartext HTTP/2 backends
pub const PORT_NAME_H2C: &str = "h2c";

const POD_LABEL: &str = "test-pod";

/// How the kubelet decides the backend is ready
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    None,
    HttpGet { path: Option<String> },
    TcpSocket,
}

/// Shape of a backend pod and its service
#[derive(Clone, Debug)]
pub struct BackendSpec {
    image: String,
    port_name: Option<String>,
    env: Vec<(String, String)>,
    readiness: Readiness,
}

impl BackendSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            port_name: None,
            env: Vec::new(),
            readiness: Readiness::None,
        }
    }

    pub fn port_name(mut self, name: impl Into<String>) -> Self {
        self.port_name = Some(name.into());
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    pub fn readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    /// Build the pod and the ClusterIP service selecting it
    pub fn build(
        &self,
        name: &str,
        config: &ConformanceConfig,
        port: i32,
        container_port: i32,
    ) -> (Pod, Service) {
        let labels = BTreeMap::from([(POD_LABEL.to_string(), name.to_string())]);
        let metadata = ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        };

        // PORT is read by every test image.
        let mut env = self.env.clone();
        env.push(("PORT".to_string(), container_port.to_string()));

        let readiness_probe = match &self.readiness {
            Readiness::None => None,
            Readiness::HttpGet { path } => Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: path.clone(),
                    port: IntOrString::Int(container_port),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            Readiness::TcpSocket => Some(Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::Int(container_port),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        };

        let pod = Pod {
            metadata: metadata.clone(),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "foo".to_string(),
                    image: Some(config.image_path(&self.image)),
                    image_pull_policy: Some("IfNotPresent".to_string()),
                    ports: Some(vec![ContainerPort {
                        name: self.port_name.clone(),
                        container_port,
                        ..Default::default()
                    }]),
                    env: Some(
                        env.into_iter()
                            .map(|(name, value)| EnvVar {
                                name,
                                value: Some(value),
                                ..Default::default()
                            })
                            .collect(),
                    ),
                    readiness_probe,
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };

        let service = Service {
            metadata,
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                ports: Some(vec![ServicePort {
                    name: self.port_name.clone(),
                    port,
                    target_port: Some(IntOrString::Int(container_port)),
                    ..Default::default()
                }]),
                selector: Some(labels),
                ..Default::default()
            }),
            ..Default::default()
        };

        (pod, service)
    }
}

/// Low service port, never zero
fn pick_service_port() -> i32 {
    rand::rng().random_range(50..100)
}

/// High container port
fn pick_container_port() -> i32 {
    rand::rng().random_range(8000..8100)
}

/// Create the backend described by `spec` and wait for it to serve
pub async fn create_backend(ctx: &TestContext, spec: &BackendSpec) -> Result<(String, i32, Cleanup)> {
    let name = ctx.object_name();
    let port = pick_service_port();
    let container_port = pick_container_port();
    info!(name = %name, port, container_port, image = %spec.image, "Creating backend");

    let (pod, service) = spec.build(&name, ctx.config(), port, container_port);
    let cleanup = create_pod_and_service(ctx, &pod, &service).await?;
    Ok((name, port, cleanup))
}

/// Backend running the runtime image, which echoes request and host details
pub async fn create_runtime_service(ctx: &TestContext, port_name: &str) -> Result<(String, i32, Cleanup)> {
    let spec = BackendSpec::new("runtime")
        .port_name(port_name)
        .readiness(Readiness::HttpGet {
            path: Some("/healthz".to_string()),
        });
    create_backend(ctx, &spec).await
}

/// Backend forwarding every request to `target`
///
/// An ExternalName service named after `target` (`name.namespace...`) is
/// created as well, pointing at `gateway_domain`.
pub async fn create_proxy_service(
    ctx: &TestContext,
    target: &str,
    gateway_domain: &str,
) -> Result<(String, i32, Cleanup)> {
    let external_name = external_name_service(target, gateway_domain)?;

    let spec = BackendSpec::new("httpproxy").env("TARGET_HOST", target);
    let (name, port, proxy_cleanup) = create_backend(ctx, &spec).await?;

    let external_cleanup = create_service(ctx, &external_name).await?;
    Ok((name, port, external_cleanup.then(proxy_cleanup)))
}

/// Backend whose responses can be delayed on request
pub async fn create_timeout_service(ctx: &TestContext) -> Result<(String, i32, Cleanup)> {
    let spec = BackendSpec::new("timeout")
        .port_name(PORT_NAME_HTTP1)
        .readiness(Readiness::HttpGet { path: None });
    create_backend(ctx, &spec).await
}

/// Backend succeeding only on every `period`th request
pub async fn create_flaky_service(ctx: &TestContext, period: u32) -> Result<(String, i32, Cleanup)> {
    let spec = BackendSpec::new("flaky")
        .port_name(PORT_NAME_HTTP1)
        .env("PERIOD", period.to_string())
        .readiness(Readiness::HttpGet {
            path: Some("/".to_string()),
        });
    create_backend(ctx, &spec).await
}

/// Backend upgrading to websockets and echoing messages with `suffix`
pub async fn create_websocket_service(ctx: &TestContext, suffix: &str) -> Result<(String, i32, Cleanup)> {
    let spec = BackendSpec::new("wsserver")
        .port_name(PORT_NAME_HTTP1)
        .env("SUFFIX", suffix)
        .readiness(Readiness::HttpGet {
            path: Some("/".to_string()),
        });
    create_backend(ctx, &spec).await
}

/// gRPC ping backend echoing messages with `suffix`
pub async fn create_grpc_service(ctx: &TestContext, suffix: &str) -> Result<(String, i32, Cleanup)> {
    let spec = BackendSpec::new("grpc-ping")
        .port_name(PORT_NAME_H2C)
        .env("SUFFIX", suffix)
        .readiness(Readiness::TcpSocket);
    create_backend(ctx, &spec).await
}

/// ExternalName service `name.namespace` from `target`, resolving to `gateway_domain`
pub fn external_name_service(target: &str, gateway_domain: &str) -> Result<Service> {
    let parts: Vec<&str> = target.splitn(3, '.').collect();
    let (name, namespace) = match parts.as_slice() {
        [name, namespace, ..] if !name.is_empty() && !namespace.is_empty() => (*name, *namespace),
        _ => {
            return Err(ConformanceError::InvalidRequest(format!(
                "proxy target {target:?} is not of the form name.namespace[.suffix]"
            )))
        }
    };

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ExternalName".to_string()),
            external_name: Some(gateway_domain.to_string()),
            session_affinity: Some("None".to_string()),
            ports: Some(vec![ServicePort {
                name: Some(PORT_NAME_H2C.to_string()),
                port: 80,
                target_port: Some(IntOrString::Int(80)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn object_ref(kind: ResourceKind, meta: &ObjectMeta) -> ResourceRef {
    ResourceRef::new(
        kind,
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

/// Create a standalone service
pub async fn create_service(ctx: &TestContext, service: &Service) -> Result<Cleanup> {
    let target = object_ref(ResourceKind::Service, &service.metadata);
    let cleanup = Cleanup::new().delete(target.clone());
    ctx.register(&cleanup);

    let api: Api<Service> = ctx.client().namespaced_api(&target.namespace);
    retry_test_errors(ctx.client().retry(), "create service", |_| async {
        api.create(&PostParams::default(), service)
            .await
            .map_err(ConformanceError::from)
    })
    .await?;

    debug!(resource = %target, "Created");
    Ok(cleanup)
}

/// Create the pod and service and wait until the service has endpoints
///
/// The cleanup removes the service before the pod.
pub async fn create_pod_and_service(ctx: &TestContext, pod: &Pod, service: &Service) -> Result<Cleanup> {
    let pod_ref = object_ref(ResourceKind::Pod, &pod.metadata);
    let service_ref = object_ref(ResourceKind::Service, &service.metadata);

    let cleanup = Cleanup::new()
        .delete(service_ref.clone())
        .delete(pod_ref.clone());
    ctx.register(&cleanup);

    let pods: Api<Pod> = ctx.client().namespaced_api(&pod_ref.namespace);
    retry_test_errors(ctx.client().retry(), "create pod", |_| async {
        pods.create(&PostParams::default(), pod)
            .await
            .map_err(ConformanceError::from)
    })
    .await?;
    debug!(resource = %pod_ref, "Created");

    let services: Api<Service> = ctx.client().namespaced_api(&service_ref.namespace);
    retry_test_errors(ctx.client().retry(), "create service", |_| async {
        services
            .create(&PostParams::default(), service)
            .await
            .map_err(ConformanceError::from)
    })
    .await?;
    debug!(resource = %service_ref, "Created");

    let endpoints: Api<Endpoints> = ctx.client().namespaced_api(&service_ref.namespace);
    let config = ctx.config();
    poll_until(
        config.poll_interval(),
        config.poll_timeout(),
        || {
            retry_test_errors(ctx.client().retry(), "get endpoints", |_| async {
                endpoints
                    .get(&service_ref.name)
                    .await
                    .map_err(ConformanceError::from)
            })
        },
        |ep: &Endpoints| Ok(has_ready_addresses(ep)),
    )
    .await
    .map_err(|e| e.into_wait_error(format!("endpoints {:?}", service_ref.name)))?;

    info!(resource = %service_ref, "Backend has endpoints");
    Ok(cleanup)
}

/// At least one subset, and every subset has an address
pub fn has_ready_addresses(endpoints: &Endpoints) -> bool {
    let subsets = endpoints.subsets.as_deref().unwrap_or_default();
    !subsets.is_empty()
        && subsets
            .iter()
            .all(|s| s.addresses.as_ref().is_some_and(|a| !a.is_empty()))
}

impl ResourceState for Endpoints {
    fn state_description(&self) -> String {
        let subsets = self.subsets.as_deref().unwrap_or_default();
        let ready: usize = subsets
            .iter()
            .map(|s| s.addresses.as_ref().map_or(0, Vec::len))
            .sum();
        let not_ready: usize = subsets
            .iter()
            .map(|s| s.not_ready_addresses.as_ref().map_or(0, Vec::len))
            .sum();
        format!(
            "{} subsets, {ready} ready and {not_ready} not ready addresses",
            subsets.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::fake::{deleted, not_found, FakeApiServer, CORE};
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset};

    fn container(pod: &Pod) -> &Container {
        &pod.spec.as_ref().unwrap().containers[0]
    }

    fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
        container
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }

    #[test]
    fn test_runtime_backend_shape() {
        let config = ConformanceConfig::default();
        let spec = BackendSpec::new("runtime")
            .port_name("http2")
            .readiness(Readiness::HttpGet {
                path: Some("/healthz".to_string()),
            });
        let (pod, service) = spec.build("runtime-abc", &config, 64, 8042);

        let c = container(&pod);
        assert_eq!(c.image.as_deref(), Some("ko.local/runtime:latest"));
        assert_eq!(c.image_pull_policy.as_deref(), Some("IfNotPresent"));
        assert_eq!(env_value(c, "PORT"), Some("8042"));
        let port = &c.ports.as_ref().unwrap()[0];
        assert_eq!(port.container_port, 8042);
        assert_eq!(port.name.as_deref(), Some("http2"));
        let probe = c.readiness_probe.as_ref().unwrap().http_get.as_ref().unwrap();
        assert_eq!(probe.path.as_deref(), Some("/healthz"));
        assert_eq!(probe.port, IntOrString::Int(8042));

        assert_eq!(pod.metadata.labels.as_ref().unwrap()["test-pod"], "runtime-abc");
        assert_eq!(pod.metadata.namespace.as_deref(), Some("serving-tests"));

        let svc = service.spec.unwrap();
        assert_eq!(svc.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(svc.selector.unwrap()["test-pod"], "runtime-abc");
        let svc_port = &svc.ports.unwrap()[0];
        assert_eq!(svc_port.port, 64);
        assert_eq!(svc_port.name.as_deref(), Some("http2"));
        assert_eq!(svc_port.target_port, Some(IntOrString::Int(8042)));
    }

    #[test]
    fn test_grpc_backend_uses_tcp_probe() {
        let spec = BackendSpec::new("grpc-ping")
            .port_name(PORT_NAME_H2C)
            .env("SUFFIX", "!")
            .readiness(Readiness::TcpSocket);
        let (pod, _) = spec.build("grpc", &ConformanceConfig::default(), 50, 8000);

        let c = container(&pod);
        assert_eq!(env_value(c, "SUFFIX"), Some("!"));
        let probe = c.readiness_probe.as_ref().unwrap();
        assert!(probe.http_get.is_none());
        assert_eq!(probe.tcp_socket.as_ref().unwrap().port, IntOrString::Int(8000));
    }

    #[test]
    fn test_proxy_backend_has_no_probe_or_port_name() {
        let spec = BackendSpec::new("httpproxy").env("TARGET_HOST", "foo.ns.example.com");
        let (pod, service) = spec.build("proxy", &ConformanceConfig::default(), 70, 8070);

        let c = container(&pod);
        assert!(c.readiness_probe.is_none());
        assert!(c.ports.as_ref().unwrap()[0].name.is_none());
        assert_eq!(env_value(c, "TARGET_HOST"), Some("foo.ns.example.com"));
        assert!(service.spec.unwrap().ports.unwrap()[0].name.is_none());
    }

    #[test]
    fn test_random_ports_in_range() {
        for _ in 0..200 {
            assert!((50..100).contains(&pick_service_port()));
            assert!((8000..8100).contains(&pick_container_port()));
        }
    }

    #[test]
    fn test_external_name_service() {
        let svc = external_name_service("target.other-ns.svc.cluster.local", "gateway.example.com").unwrap();
        assert_eq!(svc.metadata.name.as_deref(), Some("target"));
        assert_eq!(svc.metadata.namespace.as_deref(), Some("other-ns"));

        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ExternalName"));
        assert_eq!(spec.external_name.as_deref(), Some("gateway.example.com"));
        assert_eq!(spec.session_affinity.as_deref(), Some("None"));
        let port = &spec.ports.unwrap()[0];
        assert_eq!((port.name.as_deref(), port.port), (Some("h2c"), 80));

        assert!(external_name_service("nodots", "gw").is_err());
    }

    #[test]
    fn test_endpoint_readiness() {
        let address = EndpointAddress {
            ip: "10.1.2.3".to_string(),
            ..Default::default()
        };
        let ready = EndpointSubset {
            addresses: Some(vec![address]),
            ..Default::default()
        };

        assert!(!has_ready_addresses(&Endpoints::default()));
        assert!(has_ready_addresses(&Endpoints {
            subsets: Some(vec![ready.clone()]),
            ..Default::default()
        }));

        let pending = Endpoints {
            subsets: Some(vec![ready, EndpointSubset::default()]),
            ..Default::default()
        };
        assert!(!has_ready_addresses(&pending));
        assert_eq!(
            pending.state_description(),
            "2 subsets, 1 ready and 0 not ready addresses"
        );
    }

    fn endpoints_with(addresses: Option<Vec<EndpointAddress>>) -> serde_json::Value {
        let endpoints = Endpoints {
            metadata: ObjectMeta {
                name: Some("runtime-abc".to_string()),
                namespace: Some("serving-tests".to_string()),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses,
                ..Default::default()
            }]),
        };
        serde_json::to_value(&endpoints).unwrap()
    }

    #[tokio::test]
    async fn test_create_pod_and_service_waits_for_endpoints() {
        let mut endpoint_gets = 0;
        let server = FakeApiServer::start(move |req| {
            let name = req.path.rsplit('/').next().unwrap_or_default().to_string();
            match req.method.as_str() {
                "POST" => (201, req.body.clone().unwrap_or_default()),
                "GET" => {
                    endpoint_gets += 1;
                    match endpoint_gets {
                        1 => not_found(&name),
                        2 => (200, endpoints_with(None)),
                        _ => (
                            200,
                            endpoints_with(Some(vec![EndpointAddress {
                                ip: "10.0.0.7".to_string(),
                                ..Default::default()
                            }])),
                        ),
                    }
                }
                "DELETE" if req.path.contains("/services/") => deleted("v1", "Service", &name),
                "DELETE" => deleted("v1", "Pod", &name),
                _ => not_found(&name),
            }
        })
        .await;
        let ctx = server.context("TestBackend");

        let (pod, service) = BackendSpec::new("runtime").build("runtime-abc", ctx.config(), 80, 8080);
        let cleanup = create_pod_and_service(&ctx, &pod, &service).await.unwrap();
        assert_eq!(ctx.pending_cleanups(), 1);

        let calls: Vec<(String, String)> = [
            ("POST", format!("{CORE}/pods")),
            ("POST", format!("{CORE}/services")),
            ("GET", format!("{CORE}/endpoints/runtime-abc")),
            ("GET", format!("{CORE}/endpoints/runtime-abc")),
            ("GET", format!("{CORE}/endpoints/runtime-abc")),
        ]
        .into_iter()
        .map(|(method, path)| (method.to_string(), path))
        .collect();
        assert_eq!(server.calls(), calls);

        cleanup.run(&ctx).await.unwrap();
        let deletes: Vec<String> = server
            .calls()
            .into_iter()
            .filter(|(method, _)| method == "DELETE")
            .map(|(_, path)| path)
            .collect();
        assert_eq!(
            deletes,
            vec![
                format!("{CORE}/services/runtime-abc"),
                format!("{CORE}/pods/runtime-abc")
            ]
        );
        assert_eq!(ctx.pending_cleanups(), 0);
    }

    #[tokio::test]
    async fn test_create_pod_and_service_stops_on_rejected_pod() {
        let server = FakeApiServer::start(|_| {
            crate::k8s::fake::status_error(422, "Invalid", "spec.containers: Required value")
        })
        .await;
        let ctx = server.context("TestBackend");

        let (pod, service) = BackendSpec::new("runtime").build("runtime-abc", ctx.config(), 80, 8080);
        let err = create_pod_and_service(&ctx, &pod, &service).await.unwrap_err();

        assert!(matches!(err, ConformanceError::Kube(kube::Error::Api(ref e)) if e.code == 422));
        assert_eq!(server.calls(), vec![("POST".to_string(), format!("{CORE}/pods"))]);
        assert_eq!(ctx.pending_cleanups(), 1);
    }
}
