//! Probe requests with response expectations
//!
//! [`runtime_request_with_expectations`] sends a request through an ingress,
//! checks each expectation against the response and, for a 200, decodes the
//! [`RuntimeInfo`] the runtime image answers with.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use futures::future::join_all;
use hyper::StatusCode;
use tracing::{debug, error, info};

use super::client::{HttpClient, HttpRequest, HttpResponse};
use super::runtime::RuntimeInfo;
use crate::error::{ConformanceError, Result};

/// Check applied to a received response
pub type ResponseExpectation = Box<dyn Fn(&HttpResponse) -> Result<()> + Send + Sync>;

/// Expect the status code to be one of `codes`
pub fn status_code_expectation(codes: impl IntoIterator<Item = u16>) -> ResponseExpectation {
    let codes: BTreeSet<u16> = codes.into_iter().collect();
    Box::new(move |response| {
        if codes.contains(&response.status_code()) {
            Ok(())
        } else {
            Err(ConformanceError::Expectation(format!(
                "got unexpected status: {}, expected {:?}",
                response.status_code(),
                codes
            )))
        }
    })
}

/// GET `url` expecting a 200 carrying runtime info
pub async fn runtime_request(client: &HttpClient, url: &str) -> Result<RuntimeInfo> {
    let info = runtime_request_with_expectations(
        client,
        &HttpRequest::get(url),
        &[status_code_expectation([StatusCode::OK.as_u16()])],
        false,
    )
    .await?;

    info.ok_or_else(|| ConformanceError::Expectation(format!("no runtime info returned by {url}")))
}

/// Send `request` and validate the response
///
/// Returns `Ok(None)` when the connection could not be dialed and
/// `allow_dial_error` is set, or when a non-200 response met every
/// expectation.
pub async fn runtime_request_with_expectations(
    client: &HttpClient,
    request: &HttpRequest,
    expectations: &[ResponseExpectation],
    allow_dial_error: bool,
) -> Result<Option<RuntimeInfo>> {
    let response = match client.send(request).await {
        Ok(response) => response,
        Err(e) if allow_dial_error && e.is_dial() => {
            debug!(url = %request.url, error = %e, "Tolerating dial error");
            return Ok(None);
        }
        Err(e) => {
            error!(url = %request.url, error = %e, "Error making {} request", request.method);
            return Err(e.into());
        }
    };

    for expectation in expectations {
        if let Err(e) = expectation(&response) {
            error!(url = %request.url, error = %e, "Error meeting response expectations");
            error!("{}", dump_response(&response));
            return Err(e);
        }
    }

    if response.status != StatusCode::OK {
        return Ok(None);
    }

    match serde_json::from_slice::<RuntimeInfo>(&response.body) {
        Ok(info) => Ok(Some(info)),
        Err(e) => {
            error!(url = %request.url, error = %e, "Unable to parse runtime image's response payload");
            error!("{}", dump_response(&response));
            Err(e.into())
        }
    }
}

/// Issue `count` runtime requests for `url`, at most `concurrency` at a time
///
/// Results are returned in request order; a failed request does not stop
/// the others.
pub async fn runtime_requests(
    client: &HttpClient,
    url: &str,
    count: usize,
    concurrency: usize,
) -> Vec<Result<RuntimeInfo>> {
    let concurrency = concurrency.max(1);
    let mut results = Vec::with_capacity(count);

    while results.len() < count {
        let batch = concurrency.min(count - results.len());
        let requests = (0..batch).map(|_| runtime_request(client, url));
        results.extend(join_all(requests).await);
    }

    let failures = results.iter().filter(|r| r.is_err()).count();
    info!(url = %url, count, failures, "Finished runtime requests");
    results
}

/// Render a response the way it appeared on the wire
pub fn dump_response(response: &HttpResponse) -> String {
    let mut out = String::new();
    let _ = write!(out, "{:?} {}\r\n", response.version, response.status);
    for (name, value) in &response.headers {
        let _ = write!(out, "{}: {}\r\n", name, String::from_utf8_lossy(value.as_bytes()));
    }
    out.push_str("\r\n");
    out.push_str(&String::from_utf8_lossy(&response.body));
    out
}
