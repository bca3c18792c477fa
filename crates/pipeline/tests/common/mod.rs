//! Shared stubs for pipeline integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pipeline::errors::TransportError;
use pipeline::{
    AppSettings, Body, Config, Context, CredentialProvider, Error, Headers, IncomingResponse,
    Method, OutgoingCall, Pipeline, StaticCredentials, Transport,
};
use tokio::io::AsyncReadExt;

pub const DOMAIN: &str = "https://open.example.com";

/// What the stub transport saw for one call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub url: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl RecordedCall {
    pub fn path(&self) -> &str {
        let rest = self.url.strip_prefix(DOMAIN).unwrap_or(&self.url);
        rest.split('?').next().unwrap_or(rest)
    }
}

type Responder =
    dyn Fn(&Context, &RecordedCall) -> Result<IncomingResponse, TransportError> + Send + Sync;

/// Records every call and answers through a closure.
pub struct StubTransport {
    calls: Mutex<Vec<RecordedCall>>,
    respond: Box<Responder>,
}

impl StubTransport {
    pub fn new(
        respond: impl Fn(&Context, &RecordedCall) -> Result<IncomingResponse, TransportError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    /// Answers every call with the same JSON envelope.
    pub fn always_json(body: &'static str) -> Arc<Self> {
        Self::new(move |_, _| Ok(json_response(body)))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.path() == path).count()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn send(
        &self,
        ctx: &Context,
        call: OutgoingCall,
    ) -> Result<IncomingResponse, TransportError> {
        let body = match call.body {
            Body::Empty => Vec::new(),
            Body::Bytes(bytes) => bytes,
            Body::File(mut file) => {
                let mut buf = Vec::new();
                file.read_to_end(&mut buf).await?;
                buf
            }
        };
        let recorded = RecordedCall {
            method: call.method,
            url: call.url,
            headers: call.headers,
            body,
        };
        self.calls.lock().push(recorded.clone());
        (self.respond)(ctx, &recorded)
    }
}

/// Credential provider that always fails app tokens with a fixed error.
pub struct FailingAppCredentials {
    pub attempts: AtomicUsize,
    pub error: fn() -> Error,
}

#[async_trait]
impl CredentialProvider for FailingAppCredentials {
    async fn attach_app_token(
        &self,
        _ctx: &Context,
        _call: OutgoingCall,
    ) -> Result<OutgoingCall, Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err((self.error)())
    }

    async fn attach_tenant_token(
        &self,
        _ctx: &Context,
        call: OutgoingCall,
        _tenant_key: &str,
    ) -> Result<OutgoingCall, Error> {
        Ok(call)
    }
}

pub fn json_headers() -> Headers {
    [
        ("Content-Type", "application/json; charset=utf-8"),
        ("X-Request-Id", "req-123"),
    ]
    .into_iter()
    .collect()
}

pub fn json_response(body: &str) -> IncomingResponse {
    IncomingResponse::from_bytes(200, json_headers(), body.as_bytes().to_vec())
}

pub fn internal_config() -> Config {
    Config::new(DOMAIN, AppSettings::internal("cli_app", "app-secret"))
}

pub fn isv_config() -> Config {
    Config::new(DOMAIN, AppSettings::isv("cli_isv", "isv-secret"))
}

pub fn credentials() -> Arc<StaticCredentials> {
    Arc::new(
        StaticCredentials::new()
            .with_app_access_token("a-token")
            .with_tenant_access_token("t-token"),
    )
}

pub fn pipeline(config: Config, transport: Arc<StubTransport>) -> Pipeline {
    Pipeline::new(config, credentials(), transport)
}
