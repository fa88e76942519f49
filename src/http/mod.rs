//! HTTP probing of ingresses under test
//!
//! Provides the dialer-bound HTTP client, the TLS trust store and the probe
//! helpers that check responses of the runtime test image.

mod client;
mod connector;
mod probe;
mod runtime;
mod trust;

pub use client::{HttpClient, HttpRequest, HttpResponse};
pub use connector::{uri_address, DialConnector};
pub use probe::{
    dump_response, runtime_request, runtime_request_with_expectations, runtime_requests, status_code_expectation,
    ResponseExpectation,
};
pub use runtime::{Cgroup, Cwd, FileInfo, HostInfo, Mount, RequestInfo, RuntimeInfo, Stdin, UserInfo};
pub use trust::TrustStore;
