//! Error and retry-policy types for the request pipeline.
//!
//! [`Error`] is the value a stage stores on a [`crate::Request`] to abort the
//! rest of the current attempt. Its variants fall into five families (see
//! [`ErrorKind`]); only [`ErrorKind::Api`] errors ever participate in the retry
//! decision, and then only when the code's [`RetryPolicy`] allows it.
//!
//! [`TransportError`] is the error type of the [`crate::Transport`] port.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// API error codes
// ---------------------------------------------------------------------------

/// Envelope code for a successful call.
pub const CODE_OK: i64 = 0;
/// The app ticket has been invalidated; a refresh is issued on the way out.
pub const CODE_APP_TICKET_INVALID: i64 = 10012;
/// Generic access token rejection.
pub const CODE_ACCESS_TOKEN_INVALID: i64 = 99991671;
/// The app access token was rejected.
pub const CODE_APP_ACCESS_TOKEN_INVALID: i64 = 99991664;
/// The tenant access token was rejected.
pub const CODE_TENANT_ACCESS_TOKEN_INVALID: i64 = 99991663;
/// The user access token was rejected.
pub const CODE_USER_ACCESS_TOKEN_INVALID: i64 = 99991668;
/// The user refresh token was rejected.
pub const CODE_USER_REFRESH_TOKEN_INVALID: i64 = 99991669;

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether a failed attempt may be re-sent unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The same call may succeed if sent again (e.g. a cached token was stale
    /// and the credential provider will hand out a fresh one).
    Retryable,
    /// Re-sending cannot help.
    NonRetryable,
}

impl RetryPolicy {
    /// Returns `true` for [`RetryPolicy::Retryable`].
    pub fn is_retryable(self) -> bool {
        matches!(self, RetryPolicy::Retryable)
    }
}

// ---------------------------------------------------------------------------
// API-level errors
// ---------------------------------------------------------------------------

/// A decoded `{code, msg}` envelope whose code is not [`CODE_OK`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("API error {code}: {msg}")]
pub struct ApiError {
    /// Numeric status code from the envelope.
    pub code: i64,
    /// Human-readable message from the envelope.
    pub msg: String,
}

impl ApiError {
    /// Creates an [`ApiError`].
    pub fn new(code: i64, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }

    /// Classifies this code for the retry loop.
    ///
    /// Only stale app/tenant token rejections are retryable. A user token
    /// cannot be refreshed by this layer, and an invalid app ticket is
    /// handled by the complement stage rather than by replay.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self.code {
            CODE_ACCESS_TOKEN_INVALID
            | CODE_APP_ACCESS_TOKEN_INVALID
            | CODE_TENANT_ACCESS_TOKEN_INVALID => RetryPolicy::Retryable,
            _ => RetryPolicy::NonRetryable,
        }
    }

    /// Returns `true` if this is the "app ticket invalid" code.
    pub fn is_app_ticket_invalid(&self) -> bool {
        self.code == CODE_APP_TICKET_INVALID
    }
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

/// Failure of the [`crate::Transport`] to produce any response at all.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The execution context was cancelled while the call was in flight.
    #[error("request cancelled")]
    Cancelled,

    /// The execution context's deadline passed before a response arrived.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The remote end could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Reading or writing the wire failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other client-library failure.
    #[error("transport error: {0}")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync>),
}

// ---------------------------------------------------------------------------
// Request errors
// ---------------------------------------------------------------------------

/// Error families used by the driver and by callers that want to branch on
/// the broad class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid credential class, identifiers, or request shape.
    Precondition,
    /// Connection or I/O failure below the envelope layer.
    Transport,
    /// Unexpected content type, status, or malformed envelope.
    Protocol,
    /// A decoded envelope with a non-zero code.
    Api,
    /// Temporary file or body-encoding failure while building the request.
    Resource,
}

/// The error field of a [`crate::Request`].
#[derive(Debug, Error)]
pub enum Error {
    /// The request's credential class is not among its accessible classes.
    #[error("access token type is invalid")]
    AccessTokenTypeInvalid,

    /// An ISV tenant-scoped request has no tenant key.
    #[error("tenant key is empty")]
    TenantKeyEmpty,

    /// An ISV user-scoped request has no user access token.
    #[error("user access token is empty")]
    UserAccessTokenEmpty,

    /// The credential provider has no app ticket to mint an app token with.
    #[error("app ticket is empty")]
    AppTicketEmpty,

    /// A `:name` placeholder in the path has no matching path parameter.
    #[error("path parameter `{0}` is not set")]
    PathParamMissing(String),

    /// The configured domain and the request path do not form a valid URL.
    #[error("invalid request URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The credential provider failed to produce a token.
    #[error("credential error: {0}")]
    Credential(String),

    /// A stage that needs the outgoing call found none, because a substituted
    /// `build` or `sign` stage did not leave one on the request.
    #[error("no outgoing call was built before the {stage} stage")]
    NoOutgoingCall { stage: &'static str },

    /// The transport produced no response.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The response was not the JSON envelope the request expected.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A stream response arrived with a non-200 status.
    #[error("response is stream, but status code: {0}")]
    StreamStatus(u16),

    /// The response body could not be decoded into the envelope.
    #[error("failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),

    /// The request input could not be encoded as JSON.
    #[error("failed to encode request body: {0}")]
    Encode(#[source] serde_json::Error),

    /// A temporary file, body copy, or response sink write failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The API answered with a non-zero code.
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl Error {
    /// Returns the family this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AccessTokenTypeInvalid
            | Error::TenantKeyEmpty
            | Error::UserAccessTokenEmpty
            | Error::AppTicketEmpty
            | Error::PathParamMissing(_)
            | Error::InvalidUrl(_)
            | Error::Credential(_)
            | Error::NoOutgoingCall { .. } => ErrorKind::Precondition,
            Error::Transport(_) => ErrorKind::Transport,
            Error::InvalidResponse(_) | Error::StreamStatus(_) | Error::Decode(_) => {
                ErrorKind::Protocol
            }
            Error::Encode(_) | Error::Io(_) => ErrorKind::Resource,
            Error::Api(_) => ErrorKind::Api,
        }
    }

    /// Returns the API error if this is one.
    pub fn as_api(&self) -> Option<&ApiError> {
        match self {
            Error::Api(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the retry policy for this error.
    ///
    /// Everything except a retryable [`ApiError`] is non-retryable.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.as_api()
            .map_or(RetryPolicy::NonRetryable, ApiError::retry_policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_app_and_tenant_tokens_are_retryable() {
        for code in [
            CODE_ACCESS_TOKEN_INVALID,
            CODE_APP_ACCESS_TOKEN_INVALID,
            CODE_TENANT_ACCESS_TOKEN_INVALID,
        ] {
            assert_eq!(ApiError::new(code, "x").retry_policy(), RetryPolicy::Retryable);
        }
    }

    #[test]
    fn ticket_and_user_token_codes_are_not_retryable() {
        for code in [
            CODE_APP_TICKET_INVALID,
            CODE_USER_ACCESS_TOKEN_INVALID,
            CODE_USER_REFRESH_TOKEN_INVALID,
            1,
        ] {
            assert_eq!(
                ApiError::new(code, "x").retry_policy(),
                RetryPolicy::NonRetryable
            );
        }
    }

    #[test]
    fn only_api_errors_can_be_retryable() {
        let err = Error::Transport(TransportError::Cancelled);
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(!err.retry_policy().is_retryable());

        let err = Error::from(ApiError::new(CODE_TENANT_ACCESS_TOKEN_INVALID, "stale"));
        assert_eq!(err.kind(), ErrorKind::Api);
        assert!(err.retry_policy().is_retryable());
    }

    #[test]
    fn api_error_display_carries_code_and_message() {
        let err = Error::from(ApiError::new(10012, "app ticket invalid"));
        assert_eq!(err.to_string(), "API error 10012: app ticket invalid");
    }
}
