//! Open API client HTTP transport adapter.
//!
//! Implements the [`pipeline::Transport`] trait over [`reqwest`]. The
//! [`pipeline`] crate sees only [`pipeline::Transport`].
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Connection pooling, TLS, HTTP/1.1 vs HTTP/2 and
//! client-level timeouts all live in the wrapped [`reqwest::Client`]. This
//! adapter maps one [`OutgoingCall`] to one HTTP exchange and adds:
//!
//! - the execution context's deadline as a per-request timeout;
//! - cancellation: a cancelled context aborts the in-flight call with
//!   [`TransportError::Cancelled`];
//! - a streaming response body, so stream outputs never buffer the whole
//!   download in memory.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use pipeline::{Body, Context, Headers, IncomingResponse, Method, OutgoingCall, Transport, TransportError};
use thiserror::Error;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

/// Default connect timeout for [`HttpTransport::new`].
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while constructing an [`HttpTransport`].
#[derive(Debug, Error)]
pub enum HttpTransportError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// [`Transport`] backed by a shared [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport with a fresh client.
    pub fn new() -> Result<Self, HttpTransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Wraps an existing client (custom TLS roots, proxies, pool limits).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn request(&self, call: OutgoingCall) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(to_reqwest_method(call.method), &call.url);
        for (name, value) in call.headers.iter() {
            builder = builder.header(name, value);
        }
        match call.body {
            Body::Empty => builder,
            Body::Bytes(bytes) => builder.body(bytes),
            Body::File(file) => builder.body(reqwest::Body::from(file)),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        ctx: &Context,
        call: OutgoingCall,
    ) -> Result<IncomingResponse, TransportError> {
        if ctx.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let method = call.method;
        let url = call.url.clone();
        let mut builder = self.request(call);
        if let Some(remaining) = ctx.remaining() {
            if remaining.is_zero() {
                return Err(TransportError::DeadlineExceeded);
            }
            builder = builder.timeout(remaining);
        }

        let response = tokio::select! {
            _ = ctx.cancelled() => {
                warn!(%method, %url, "request cancelled in flight");
                return Err(TransportError::Cancelled);
            }
            result = builder.send() => result.map_err(map_error)?,
        };

        let status = response.status().as_u16();
        debug!(%method, %url, status, "response received");
        let headers: Headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = StreamReader::new(response.bytes_stream().map_err(std::io::Error::other));
        Ok(IncomingResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn map_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::DeadlineExceeded
    } else if err.is_connect() {
        TransportError::Connection(err.to_string())
    } else {
        TransportError::Other(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_map_one_to_one() {
        for (ours, theirs) in [
            (Method::Get, reqwest::Method::GET),
            (Method::Post, reqwest::Method::POST),
            (Method::Put, reqwest::Method::PUT),
            (Method::Patch, reqwest::Method::PATCH),
            (Method::Delete, reqwest::Method::DELETE),
        ] {
            assert_eq!(to_reqwest_method(ours), theirs);
        }
    }
}
