//! Port traits for the pipeline's external collaborators and the wire-level
//! value types that cross them.
//!
//! | Port | Implemented by |
//! |------|----------------|
//! | [`Transport`] | `http-transport` (reqwest), test stubs |
//! | [`CredentialProvider`] | [`crate::StaticCredentials`], token caches owned by the caller |

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::errors::{Error, TransportError};
use crate::Context;

// ---------------------------------------------------------------------------
// Headers and methods
// ---------------------------------------------------------------------------

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every value of `name` with `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.0.push((name, value.into()));
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        )
    }
}

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            other => Err(format!("unsupported HTTP method: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Outgoing call
// ---------------------------------------------------------------------------

/// Body handed to the transport for one attempt.
pub enum Body {
    /// No body; the request input was [`crate::Input::None`].
    Empty,
    /// An in-memory JSON, raw, or small multipart body.
    Bytes(Vec<u8>),
    /// A rewound temporary file holding a large multipart body.
    File(tokio::fs::File),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Body::File(_) => f.write_str("File"),
        }
    }
}

/// A fully built, transport-ready call.
#[derive(Debug)]
pub struct OutgoingCall {
    pub method: Method,
    /// Absolute URL including the query string.
    pub url: String,
    /// Default headers, content type, and the bearer credential once signed.
    pub headers: Headers,
    pub body: Body,
}

impl OutgoingCall {
    /// Sets `Authorization: Bearer <token>`.
    #[must_use]
    pub fn with_bearer(mut self, token: &str) -> Self {
        self.headers.set("Authorization", format!("Bearer {token}"));
        self
    }
}

// ---------------------------------------------------------------------------
// Incoming response
// ---------------------------------------------------------------------------

/// Streaming response body.
pub type ResponseBody = Pin<Box<dyn AsyncRead + Send>>;

/// What the transport received.
pub struct IncomingResponse {
    /// HTTP status code.
    pub status: u16,
    pub headers: Headers,
    /// Unread body; the decode stage drains or copies it.
    pub body: ResponseBody,
}

impl IncomingResponse {
    /// Builds a response around an in-memory body.
    pub fn from_bytes(status: u16, headers: Headers, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers,
            body: Box::pin(std::io::Cursor::new(body.into())),
        }
    }

    /// Drains the body into memory.
    pub async fn read_body(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.body.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

impl fmt::Debug for IncomingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Sends one call and returns whatever the server answered.
///
/// Implementations honour the context's deadline and cancellation per call. A
/// response with any status is `Ok`; `Err` means no response was obtained.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        ctx: &Context,
        call: OutgoingCall,
    ) -> Result<IncomingResponse, TransportError>;
}

/// Acquires tokens and attaches them to outgoing calls.
///
/// Token caching and refresh policy belong to the implementation, which must
/// be safe to share between concurrently executing requests.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Attaches an app access token.
    async fn attach_app_token(&self, ctx: &Context, call: OutgoingCall)
        -> Result<OutgoingCall, Error>;

    /// Attaches a tenant access token. `tenant_key` is empty for internal apps.
    async fn attach_tenant_token(
        &self,
        ctx: &Context,
        call: OutgoingCall,
        tenant_key: &str,
    ) -> Result<OutgoingCall, Error>;

    /// Attaches the caller-supplied user access token.
    async fn attach_user_token(
        &self,
        _ctx: &Context,
        call: OutgoingCall,
        user_access_token: &str,
    ) -> Result<OutgoingCall, Error> {
        Ok(call.with_bearer(user_access_token))
    }
}
