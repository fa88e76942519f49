//! Scripted loopback API server for exercising the resource helpers
//!
//! Every request is recorded and answered by a handler returning a status
//! code and a JSON body.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use super::client::K8sClient;
use crate::config::ConformanceConfig;
use crate::context::TestContext;
use crate::retry::BackoffConfig;

pub(crate) const INGRESSES: &str =
    "/apis/networking.internal.knative.dev/v1alpha1/namespaces/serving-tests/ingresses";
pub(crate) const CORE: &str = "/api/v1/namespaces/serving-tests";

#[derive(Clone, Debug)]
pub(crate) struct ApiRequest {
    pub method: String,
    /// Request path without the query string
    pub path: String,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn is(&self, method: &str, path: &str) -> bool {
        self.method == method && self.path == path
    }
}

type Handler = Box<dyn FnMut(&ApiRequest) -> (u16, Value) + Send>;

pub(crate) struct FakeApiServer {
    port: u16,
    requests: Arc<Mutex<Vec<ApiRequest>>>,
}

impl FakeApiServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: FnMut(&ApiRequest) -> (u16, Value) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Box::new(handler);
        let handler = Arc::new(Mutex::new(handler));

        let recorded = requests.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, recorded.clone(), handler.clone()));
            }
        });

        Self { port, requests }
    }

    /// Context talking to this server with fast polling and API retries
    pub fn context(&self, test_name: &str) -> TestContext {
        let config = kube::Config::new(format!("http://127.0.0.1:{}", self.port).parse().unwrap());
        let client = K8sClient::with_config(config).unwrap();

        let conformance = ConformanceConfig {
            poll_interval_ms: 10,
            poll_timeout_secs: 5,
            api_retry: BackoffConfig {
                initial_delay_ms: 1,
                factor: 1.0,
                jitter: 0.0,
                steps: 3,
                cap_ms: 1,
            },
            ..Default::default()
        };
        TestContext::new(client, conformance, test_name)
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// `(method, path)` of every request so far
    pub fn calls(&self) -> Vec<(String, String)> {
        self.requests()
            .into_iter()
            .map(|r| (r.method, r.path))
            .collect()
    }
}

async fn serve(stream: TcpStream, requests: Arc<Mutex<Vec<ApiRequest>>>, handler: Arc<Mutex<Handler>>) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    loop {
        let mut request_line = String::new();
        match reader.read_line(&mut request_line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let target = parts.next().unwrap_or_default();
        let path = target.split('?').next().unwrap_or_default().to_string();

        let mut content_length = 0;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                return;
            }
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }

        let mut body = vec![0u8; content_length];
        if reader.read_exact(&mut body).await.is_err() {
            return;
        }
        let request = ApiRequest {
            method,
            path,
            body: serde_json::from_slice(&body).ok(),
        };

        let (status, reply) = {
            let mut handler = handler.lock().unwrap();
            (*handler)(&request)
        };
        requests.lock().unwrap().push(request);

        let reply = reply.to_string();
        let response = format!(
            "HTTP/1.1 {status} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{reply}",
            reason(status),
            reply.len(),
        );
        if write.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        404 => "Not Found",
        409 => "Conflict",
        _ => "Unknown",
    }
}

/// Failure body in the shape of a `metav1.Status`
pub(crate) fn status_error(code: u16, reason: &str, message: &str) -> (u16, Value) {
    (
        code,
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": message,
            "reason": reason,
            "code": code,
        }),
    )
}

pub(crate) fn not_found(name: &str) -> (u16, Value) {
    status_error(404, "NotFound", &format!("{name:?} not found"))
}

/// Minimal object returned for a delete
pub(crate) fn deleted(api_version: &str, kind: &str, name: &str) -> (u16, Value) {
    (
        200,
        json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": { "name": name, "namespace": "serving-tests" },
        }),
    )
}
