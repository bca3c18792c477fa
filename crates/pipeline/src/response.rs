//! Output destinations and envelope decoding.
//!
//! The caller chooses the envelope shape when it registers the output, so the
//! decoder never has to guess:
//!
//! - [`Envelope::Wrapped`]: `{"code": 0, "msg": "ok", "data": {...}}`; the
//!   output receives the `data` subtree.
//! - [`Envelope::Flat`]: `{"code": 0, "msg": "ok", "name": "x", ...}`; the
//!   output's own fields sit beside `code`/`msg`.
//!
//! Both paths first read the `{code, msg}` header. A non-zero code produces an
//! [`ApiError`] without requiring the output's fields to be present.

use std::any::Any;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::io::AsyncWrite;

use crate::errors::{ApiError, Error, CODE_OK};

/// Envelope shape of a JSON response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Envelope {
    /// Output nested under `data`.
    #[default]
    Wrapped,
    /// Output fields merged beside `code` and `msg`.
    Flat,
}

/// Output type for calls whose response carries no data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NoData {}

#[derive(Deserialize)]
struct Status {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

#[derive(Deserialize)]
struct Wrapped<T> {
    data: Option<T>,
}

#[derive(Deserialize)]
struct Flat<T> {
    #[serde(flatten)]
    data: T,
}

/// Decodes `body` as an envelope of the given shape.
///
/// Returns the decoded output (if any) on a zero code and an
/// [`Error::Api`] otherwise.
pub fn decode_envelope<T: DeserializeOwned>(
    body: &[u8],
    envelope: Envelope,
) -> Result<Option<T>, Error> {
    let status: Status = serde_json::from_slice(body).map_err(Error::Decode)?;
    if status.code != CODE_OK {
        return Err(ApiError::new(status.code, status.msg).into());
    }
    match envelope {
        Envelope::Wrapped => {
            let wrapped: Wrapped<T> = serde_json::from_slice(body).map_err(Error::Decode)?;
            Ok(wrapped.data)
        }
        Envelope::Flat => {
            let flat: Flat<T> = serde_json::from_slice(body).map_err(Error::Decode)?;
            Ok(Some(flat.data))
        }
    }
}

// ---------------------------------------------------------------------------
// Output destinations
// ---------------------------------------------------------------------------

/// Type-erased JSON output slot stored on a request.
pub trait ResponseDecoder: Send {
    /// Decodes a complete response body into this slot.
    fn decode(&mut self, body: &[u8]) -> Result<(), Error>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// A typed JSON output slot.
pub struct JsonOutput<T> {
    envelope: Envelope,
    value: Option<T>,
}

impl<T> JsonOutput<T> {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            value: None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        self.value
    }
}

impl<T: DeserializeOwned + Send + 'static> ResponseDecoder for JsonOutput<T> {
    fn decode(&mut self, body: &[u8]) -> Result<(), Error> {
        self.value = decode_envelope(body, self.envelope)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Writable sink for opaque byte-stream responses.
pub trait ResponseSink: AsyncWrite + Send + Unpin + 'static {
    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<W: AsyncWrite + Send + Unpin + 'static> ResponseSink for W {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Where a request's response goes.
pub enum Output {
    /// Decode a JSON envelope.
    Json(Box<dyn ResponseDecoder>),
    /// Copy the raw body into a sink; no JSON parsing.
    Stream(Box<dyn ResponseSink>),
}

impl Output {
    /// JSON output decoded into `T` using the given envelope shape.
    pub fn json<T: DeserializeOwned + Send + 'static>(envelope: Envelope) -> Self {
        Output::Json(Box::new(JsonOutput::<T>::new(envelope)))
    }

    /// Wrapped envelope with no data.
    pub fn no_data() -> Self {
        Self::json::<NoData>(Envelope::Wrapped)
    }

    /// Raw byte stream written into `sink`.
    pub fn stream<W: AsyncWrite + Send + Unpin + 'static>(sink: W) -> Self {
        Output::Stream(Box::new(sink))
    }

    /// Returns `true` for [`Output::Stream`].
    pub fn is_stream(&self) -> bool {
        matches!(self, Output::Stream(_))
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::no_data()
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Json(_) => f.write_str("Output::Json"),
            Output::Stream(_) => f.write_str("Output::Stream"),
        }
    }
}
