//! Request-execution core of the Open API client.
//!
//! Turns a logical [`Request`] (path, method, input, output shape, credential
//! class) into a signed, transport-ready call, executes it, validates and
//! decodes the response, and recovers from app-ticket invalidation by issuing
//! a re-send request on the way out.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no HTTP client
//! dependency. Transports implement [`Transport`]; token sources implement
//! [`CredentialProvider`].
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`context`] | Cancellable, deadline-bearing execution context with a shared value map |
//! | [`config`] | Immutable pipeline configuration and wire constants |
//! | [`errors`] | Error taxonomy, API error codes, retry policy |
//! | [`request`] | The mutable request record, inputs, multipart forms |
//! | [`response`] | Output slots and wrapped / flat envelope decoding |
//! | [`body`] | Body materialisation and replay across retries |
//! | [`ports`] | `Transport` and `CredentialProvider` traits, wire value types |
//! | [`handlers`] | Stage contract and the default stages |
//! | [`driver`] | The retrying [`Pipeline`] driver |
//! | [`credentials`] | Fixed-token credential provider |

pub mod body;
pub mod config;
pub mod context;
pub mod credentials;
pub mod driver;
pub mod errors;
pub mod handlers;
pub mod ports;
pub mod request;
pub mod response;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use body::BodySource;
pub use config::{AppSettings, AppType, Config};
pub use context::Context;
pub use credentials::StaticCredentials;
pub use driver::{BoxFuture, Pipeline};
pub use errors::{ApiError, Error, ErrorKind, RetryPolicy, TransportError};
pub use handlers::{Handlers, Stage};
pub use ports::{Body, CredentialProvider, Headers, IncomingResponse, Method, OutgoingCall, Transport};
pub use request::{AccessTokenType, FileContent, FormData, FormFile, Input, Request};
pub use response::{Envelope, NoData, Output};
