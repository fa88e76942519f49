//! Kubernetes resources used by conformance tests
//!
//! Backend workloads, TLS secrets and the ingress resource under test, plus
//! the client wrapper and cleanup references they share.

mod backend;
mod client;
#[cfg(test)]
pub(crate) mod fake;
mod ingress;
mod secret;

pub use backend::{
    create_backend, create_flaky_service, create_grpc_service, create_pod_and_service,
    create_proxy_service, create_runtime_service, create_service, create_timeout_service,
    create_websocket_service, external_name_service, has_ready_addresses, BackendSpec, Readiness,
    PORT_NAME_H2C, PORT_NAME_HTTP1,
};
pub use client::{K8sClient, ResourceKind, ResourceRef, INGRESS_CRD_NAME};
pub use ingress::{
    create_ingress, create_ingress_ready, create_ingress_ready_dial_context, is_ingress_ready,
    update_ingress, update_ingress_ready, wait_for_ingress_state, HeaderMatch,
    HttpIngressPath, HttpIngressRuleValue, HttpOption, Ingress, IngressBackendSplit,
    IngressCondition, IngressManager, IngressRule, IngressSpec, IngressStatus, IngressTls,
    IngressVisibility, LoadBalancerIngressStatus, LoadBalancerStatus, INGRESS_CLASS_ANNOTATION,
    READY_CONDITION,
};
pub use secret::{
    create_tls_secret, create_tls_secret_with_trust_store, generate_certificate, tls_secret,
    TlsCertificate, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY, TLS_SECRET_TYPE,
};
