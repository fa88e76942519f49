//! Dialing the public load balancer of an ingress
//!
//! A [`DialContext`] is resolved once from the Kubernetes Service behind the
//! ingress' public load balancer and then maps every `host:port` a client
//! asks for onto an address that actually reaches the cluster:
//!
//! * with a manual ingress endpoint the requested port is matched against the
//!   Service's ports and the matching node port is dialed on that endpoint;
//! * otherwise the first load balancer entry of the Service is dialed, by IP
//!   when it has one and by hostname when it does not, on the requested port.
//!
//! Only the first entry of each load balancer list is used.

use std::io;
use std::net::Ipv6Addr;

use k8s_openapi::api::core::v1::{LoadBalancerIngress, Service};
use kube::api::Api;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use crate::config::ConformanceConfig;
use crate::error::{ConformanceError, DialError, Result};
use crate::k8s::{Ingress, K8sClient};
use crate::retry::{retry_test_errors, BackoffConfig};

/// Port declared by the load balancer Service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicePortMapping {
    pub port: i32,
    pub node_port: Option<i32>,
}

/// Where connections are sent
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DialTarget {
    /// Manually configured endpoint reached through the Service's node ports
    NodePort {
        endpoint: String,
        ports: Vec<ServicePortMapping>,
    },

    /// First ingress entry of the Service's load balancer status
    LoadBalancer {
        ip: Option<String>,
        hostname: Option<String>,
    },
}

/// Dialer bound to an ingress' public load balancer
#[derive(Clone, Debug)]
pub struct DialContext {
    target: DialTarget,
    backoff: BackoffConfig,
}

impl DialContext {
    pub fn new(target: DialTarget, backoff: BackoffConfig) -> Self {
        Self { target, backoff }
    }

    /// Derive the dial target from the load balancer Service
    ///
    /// `endpoint_override` takes precedence over the Service's load balancer
    /// status. A Service with neither has no supported shape.
    pub fn from_service(
        service: &Service,
        endpoint_override: Option<&str>,
        backoff: BackoffConfig,
    ) -> Result<Self> {
        if let Some(endpoint) = endpoint_override.filter(|e| !e.is_empty()) {
            check_endpoint_host(endpoint)?;
            let ports = service
                .spec
                .as_ref()
                .and_then(|s| s.ports.as_ref())
                .map(|ports| {
                    ports
                        .iter()
                        .map(|p| ServicePortMapping {
                            port: p.port,
                            node_port: p.node_port,
                        })
                        .collect()
                })
                .unwrap_or_default();

            info!(endpoint = %endpoint, "Using manual ingress endpoint");
            return Ok(Self::new(
                DialTarget::NodePort {
                    endpoint: endpoint.to_string(),
                    ports,
                },
                backoff,
            ));
        }

        let lb_ingress: Option<&LoadBalancerIngress> = service
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .and_then(|ingress| ingress.first());

        match lb_ingress {
            Some(entry) => Ok(Self::new(
                DialTarget::LoadBalancer {
                    ip: entry.ip.clone().filter(|ip| !ip.is_empty()),
                    hostname: entry.hostname.clone().filter(|h| !h.is_empty()),
                },
                backoff,
            )),
            None => Err(ConformanceError::UnsupportedService(
                "not type LoadBalancer? missing ingress endpoint?".to_string(),
            )),
        }
    }

    pub fn target(&self) -> &DialTarget {
        &self.target
    }

    pub fn backoff(&self) -> &BackoffConfig {
        &self.backoff
    }

    /// Map the requested `host:port` onto the address that is dialed
    ///
    /// The requested host is ignored; only its port is carried over.
    pub fn resolve_address(&self, address: &str) -> Result<String, DialError> {
        let (_, port) = split_host_port(address)?;

        match &self.target {
            DialTarget::NodePort { endpoint, ports } => {
                let mapping = ports
                    .iter()
                    .find(|p| p.port == i32::from(port))
                    .ok_or_else(|| DialError::NoMatchingPort(port.to_string()))?;
                let node_port = mapping.node_port.ok_or(DialError::NoNodePort(mapping.port))?;
                Ok(join_host_port(endpoint, node_port))
            }
            DialTarget::LoadBalancer { ip, hostname } => ip
                .as_deref()
                .or(hostname.as_deref())
                .map(|host| join_host_port(host, port))
                .ok_or(DialError::NoDialInfo),
        }
    }

    /// Connect to the resolved address of `address`
    ///
    /// Refused and timed out connects are retried per the backoff; each
    /// attempt's connect timeout grows with the backoff delay.
    pub async fn dial(&self, address: &str) -> Result<TcpStream, DialError> {
        let target = self.resolve_address(address)?;
        let mut delays = self.backoff.delays();
        let mut attempt_timeout = self.backoff.initial_delay();
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let err = match timeout(attempt_timeout, TcpStream::connect(&target)).await {
                Ok(Ok(stream)) => {
                    debug!(address = %address, target = %target, attempts, "Dialed");
                    return Ok(stream);
                }
                Ok(Err(e)) => e,
                Err(_) => io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {attempt_timeout:?}"),
                ),
            };

            let delay = match delays.next() {
                Some(delay) if is_retryable(&err) => delay,
                _ => {
                    return Err(DialError::Connect {
                        target,
                        attempts,
                        source: err,
                    })
                }
            };

            debug!(target = %target, attempts, error = %err, delay_ms = delay.as_millis() as u64, "Dial failed, retrying");
            if err.kind() != io::ErrorKind::TimedOut {
                sleep(delay).await;
            }
            attempt_timeout = delay;
        }
    }
}

fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

/// Reject a manual ingress endpoint that is not a bare host
///
/// Ports always come from the Service's node ports, so `host:port` and
/// bracketed forms are refused. An unbracketed IPv6 address is accepted.
pub fn check_endpoint_host(endpoint: &str) -> Result<()> {
    if endpoint.contains(':') && endpoint.parse::<Ipv6Addr>().is_err() {
        return Err(ConformanceError::Config(format!(
            "ingress endpoint {endpoint:?} must be a host without a port"
        )));
    }
    Ok(())
}

/// Split `host:port`, accepting bracketed IPv6 hosts
pub fn split_host_port(address: &str) -> Result<(&str, u16), DialError> {
    let invalid = |reason: &str| DialError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = address.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    let host = match host.strip_prefix('[') {
        Some(rest) => rest
            .strip_suffix(']')
            .ok_or_else(|| invalid("unterminated IPv6 host"))?,
        None if host.contains(':') => return Err(invalid("too many colons")),
        None => host,
    };
    let port = port.parse().map_err(|_| invalid("invalid port"))?;

    Ok((host, port))
}

fn join_host_port(host: &str, port: impl std::fmt::Display) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// `(name, namespace)` of the Service behind the ingress' public load balancer
///
/// The internal domain is expected to look like `name.namespace.svc...`.
pub fn load_balancer_service_ref(ingress: &Ingress) -> Result<(String, String)> {
    let lb = ingress.public_load_balancer().ok_or_else(|| {
        ConformanceError::InvalidIngress(
            "ingress does not have a public load balancer assigned".to_string(),
        )
    })?;

    let internal_domain = lb.domain_internal.as_deref().unwrap_or_default();
    match internal_domain.splitn(3, '.').collect::<Vec<_>>().as_slice() {
        [name, namespace, _] => Ok((name.to_string(), namespace.to_string())),
        _ => Err(ConformanceError::InvalidIngress(format!(
            "too few parts in internal domain: {internal_domain:?}"
        ))),
    }
}

/// Build a dialer for the ingress' public load balancer
pub async fn create_dial_context(
    client: &K8sClient,
    ingress: &Ingress,
    config: &ConformanceConfig,
) -> Result<DialContext> {
    let (name, namespace) = load_balancer_service_ref(ingress)?;

    let services: Api<Service> = client.namespaced_api(&namespace);
    let service = retry_test_errors(client.retry(), "get load balancer service", |_| async {
        services.get(&name).await.map_err(ConformanceError::from)
    })
    .await?;

    debug!(namespace = %namespace, name = %name, "Resolved load balancer service");
    DialContext::from_service(
        &service,
        config.ingress_endpoint.as_deref(),
        config.dial_backoff.clone(),
    )
}
