//! HTTP client for probing an ingress
//!
//! Every connection goes through the ingress' [`DialContext`]; TLS is
//! verified against a [`TrustStore`] snapshot taken when the client is built.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use hyper::{Method, Request, StatusCode, Uri, Version};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::ClientConfig;
use tracing::debug;

use super::connector::DialConnector;
use super::trust::TrustStore;
use crate::dial::DialContext;
use crate::error::{ConformanceError, DialError, ProbeError, Result};

const DEFAULT_USER_AGENT: &str = concat!("ingress-conformance/", env!("CARGO_PKG_VERSION"));
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client bound to an ingress' load balancer
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<DialConnector>, Full<Bytes>>,
    user_agent: HeaderValue,
    timeout: Duration,
}

impl HttpClient {
    /// Create a client dialing through `dialer`
    ///
    /// Without a trust store HTTPS requests fail certificate verification.
    pub fn new(dialer: DialContext, trust: Option<&TrustStore>) -> Result<Self> {
        let roots = trust.map(TrustStore::root_store).unwrap_or_else(rustls::RootCertStore::empty);

        let tls = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| ConformanceError::Certificate(format!("failed to build TLS config: {e}")))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(DialConnector::new(dialer));

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            client,
            user_agent: HeaderValue::from_static(DEFAULT_USER_AGENT),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Set the User-Agent sent with every request
    ///
    /// Values that are not valid header text keep the previous agent.
    pub fn with_user_agent(mut self, user_agent: impl AsRef<str>) -> Self {
        match HeaderValue::from_str(user_agent.as_ref()) {
            Ok(value) => self.user_agent = value,
            Err(e) => debug!(user_agent = %user_agent.as_ref(), error = %e, "Ignoring invalid User-Agent"),
        }
        self
    }

    /// Set the deadline covering connect, request and body
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send HTTP request
    pub async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, ProbeError> {
        let url = request.url.clone();
        debug!("Sending {} request to {}", request.method, url);

        let other = |message: String| ProbeError::Other {
            url: url.clone(),
            message,
        };

        let uri: Uri = url.parse().map_err(|e| other(format!("invalid URL: {e}")))?;
        let mut req = Request::builder()
            .method(request.method.clone())
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|e| other(format!("invalid request: {e}")))?;

        for (name, value) in &request.headers {
            req.headers_mut().append(name.clone(), value.clone());
        }
        req.headers_mut().insert(USER_AGENT, self.user_agent.clone());

        let start = Instant::now();
        let exchange = async {
            let response = self.client.request(req).await.map_err(|e| classify(&url, &e))?;
            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| other(format!("failed to read response body: {e}")))?
                .to_bytes();
            Ok::<_, ProbeError>((parts, body))
        };

        let (parts, body) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ProbeError::Timeout {
                url: url.clone(),
                timeout: self.timeout,
            })??;

        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(
            "Response: {} {} in {}ms",
            parts.status.as_u16(),
            parts.status.canonical_reason().unwrap_or(""),
            duration_ms
        );

        Ok(HttpResponse {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            body,
            duration_ms,
        })
    }

    /// Convenience method for GET request
    pub async fn get(&self, url: &str) -> std::result::Result<HttpResponse, ProbeError> {
        self.send(&HttpRequest::get(url)).await
    }
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("user_agent", &self.user_agent)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Dial failures surface as a [`DialError`] somewhere in the source chain
///
/// Only failed connects count as dial errors; a target that cannot be
/// resolved is a misconfiguration.
fn classify(url: &str, err: &(dyn StdError + 'static)) -> ProbeError {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(dial) = e.downcast_ref::<DialError>() {
            let url = url.to_string();
            let message = dial.to_string();
            return if dial.is_connect() {
                ProbeError::Dial { url, message }
            } else {
                ProbeError::Resolve { url, message }
            };
        }
        source = e.source();
    }

    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        message.push_str(": ");
        message.push_str(&e.to_string());
        source = e.source();
    }
    ProbeError::Other {
        url: url.to_string(),
        message,
    }
}

/// HTTP request description
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Add a header; invalid names or values are rejected
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ConformanceError::InvalidRequest(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ConformanceError::InvalidRequest(format!("invalid header value {value:?}: {e}")))?;
        self.headers.append(name, value);
        Ok(self)
    }
}

/// HTTP response with the body fully read
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub duration_ms: u64,
}

impl HttpResponse {
    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
