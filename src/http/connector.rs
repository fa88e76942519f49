//! hyper connector that routes every connection through a [`DialContext`]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hyper::Uri;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::dial::DialContext;
use crate::error::DialError;

/// Connector handing the URI's `host:port` to the dialer
#[derive(Clone, Debug)]
pub struct DialConnector {
    dialer: Arc<DialContext>,
}

impl DialConnector {
    pub fn new(dialer: DialContext) -> Self {
        Self {
            dialer: Arc::new(dialer),
        }
    }

    pub fn dialer(&self) -> &DialContext {
        &self.dialer
    }
}

impl tower_service::Service<Uri> for DialConnector {
    type Response = TokioIo<TcpStream>;
    type Error = DialError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = self.dialer.clone();
        Box::pin(async move {
            let address = uri_address(&uri)?;
            let stream = dialer.dial(&address).await?;
            Ok(TokioIo::new(stream))
        })
    }
}

/// `host:port` of a URI, defaulting the port from the scheme
pub fn uri_address(uri: &Uri) -> Result<String, DialError> {
    let host = uri.host().ok_or_else(|| DialError::InvalidAddress {
        address: uri.to_string(),
        reason: "missing host".to_string(),
    })?;
    let port = match uri.port_u16() {
        Some(port) => port,
        None if uri.scheme_str() == Some("https") => 443,
        None => 80,
    };
    Ok(format!("{host}:{port}"))
}
