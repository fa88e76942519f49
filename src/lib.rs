//! Conformance test helpers for Knative-style Kubernetes ingress implementations
//!
//! The crate provisions throwaway backends, creates and mutates the
//! `networking.internal.knative.dev` Ingress resource, waits for it to
//! converge and probes it through a dialer bound to the ingress' load
//! balancer.
//!
//! ```ignore
//! use ingress_conformance::{k8s, ConformanceConfig, K8sClient, TestContext};
//!
//! let ctx = TestContext::new(K8sClient::new().await?, ConformanceConfig::default(), "TestBasics");
//! let (name, port, _) = k8s::create_runtime_service(&ctx, k8s::PORT_NAME_HTTP1).await?;
//! let host = format!("{}.example.com", ctx.object_name());
//! let spec = k8s::IngressSpec::single_backend(&host, &ctx.config().namespace, &name, port);
//! let (_, client, _) = k8s::create_ingress_ready(&ctx, spec).await?;
//! let info = ingress_conformance::http::runtime_request(&client, &format!("http://{host}")).await?;
//! ctx.teardown().await?;
//! ```

pub mod config;
pub mod context;
pub mod dial;
pub mod error;
pub mod http;
pub mod k8s;
pub mod poll;
pub mod retry;
pub mod utils;

pub use config::ConformanceConfig;
pub use context::{Cleanup, TestContext};
pub use dial::DialContext;
pub use error::{ConformanceError, Result};
pub use k8s::K8sClient;
