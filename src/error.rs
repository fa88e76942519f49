//! Error types
//!
//! One enum covers every failure a conformance helper can surface. The
//! classification helpers (`is_not_found`, `is_transient`, `is_dial`) are
//! what the poller, the retry wrapper and the probe helpers branch on.

use std::time::Duration;
use thiserror::Error;

use crate::retry;

/// Result alias used throughout the crate
pub type Result<T, E = ConformanceError> = std::result::Result<T, E>;

/// Failures establishing a connection through a [`crate::dial::DialContext`]
#[derive(Error, Debug)]
pub enum DialError {
    #[error("invalid dial address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("service doesn't contain a matching port: {0}")]
    NoMatchingPort(String),

    #[error("service port {0} has no node port assigned")]
    NoNodePort(i32),

    #[error("service ingress does not contain dialing information")]
    NoDialInfo,

    #[error("failed to dial {target} after {attempts} attempt(s): {source}")]
    Connect {
        target: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
}

impl DialError {
    /// The target was resolved but no connection could be established
    pub fn is_connect(&self) -> bool {
        matches!(self, DialError::Connect { .. })
    }
}

/// Transport-level failure of a probe request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("dial error for {url}: {message}")]
    Dial { url: String, message: String },

    #[error("cannot resolve dial target for {url}: {message}")]
    Resolve { url: String, message: String },

    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("request to {url} failed: {message}")]
    Other { url: String, message: String },
}

impl ProbeError {
    /// Whether the request never reached the ingress
    pub fn is_dial(&self) -> bool {
        matches!(self, ProbeError::Dial { .. })
    }

}

/// Conformance helper errors
#[derive(Error, Debug)]
pub enum ConformanceError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{resource} is not in desired state after {elapsed:?}, got: {last_state}")]
    WaitTimeout {
        resource: String,
        last_state: String,
        elapsed: Duration,
    },

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("response expectation not met: {0}")]
    Expectation(String),

    #[error("invalid ingress: {0}")]
    InvalidIngress(String),

    #[error("service does not have a supported shape: {0}")]
    UnsupportedService(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to parse payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConformanceError {
    /// The API server reported the object as missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConformanceError::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Worth retrying at the API-call layer
    pub fn is_transient(&self) -> bool {
        match self {
            ConformanceError::Kube(e) => retry::is_transient_kube_error(e),
            _ => false,
        }
    }

    /// A probe that failed before reaching the ingress
    pub fn is_dial(&self) -> bool {
        match self {
            ConformanceError::Dial(e) => e.is_connect(),
            ConformanceError::Probe(e) => e.is_dial(),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ConformanceError::WaitTimeout { .. } | ConformanceError::Probe(ProbeError::Timeout { .. })
        )
    }
}

impl From<rcgen::Error> for ConformanceError {
    fn from(e: rcgen::Error) -> Self {
        ConformanceError::Certificate(e.to_string())
    }
}

/// Build a kube API error with the given status code, mostly useful in tests
pub fn api_error(code: u16, reason: &str, message: &str) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    })
}
