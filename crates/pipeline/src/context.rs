//! Per-operation execution context.
//!
//! A [`Context`] is created by the caller for one logical operation and passed
//! by reference into the driver. It carries the caller's cancellation token and
//! optional deadline, which transports honour per attempt, plus a string-keyed
//! value map that stages write into (request id, HTTP status) and that other
//! threads may read concurrently.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

/// Context key under which the transport stage records the echoed request id.
pub const KEY_REQUEST_ID: &str = "X-Request-Id";
/// Context key under which the transport stage records the HTTP status code.
pub const KEY_HTTP_STATUS_CODE: &str = "http_status_code";

type Value = Arc<dyn Any + Send + Sync>;

/// Cancellable, deadline-bearing handle with a concurrent value map.
#[derive(Debug, Default)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    values: RwLock<HashMap<String, Value>>,
}

impl Context {
    /// Creates a context with no deadline and a fresh cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a caller-owned cancellation token. Cancelling it aborts the
    /// in-flight transport call of any operation using this context.
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    /// Sets an absolute deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets a deadline `timeout` from now.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a context for a nested operation: it inherits the deadline and
    /// is cancelled with `self`, but records its own values.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            values: RwLock::default(),
        }
    }

    /// Returns the deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the time left before the deadline, `Some(ZERO)` once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Returns a clone of the cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels the context.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns `true` once the context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set<V: Any + Send + Sync>(&self, key: impl Into<String>, value: V) {
        self.values.write().insert(key.into(), Arc::new(value));
    }

    /// Returns the raw value stored under `key`.
    pub fn get(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.values.read().get(key).cloned()
    }

    /// Returns a clone of the value under `key` if it has type `V`.
    pub fn get_as<V: Any + Clone>(&self, key: &str) -> Option<V> {
        self.get(key)
            .and_then(|v| v.downcast_ref::<V>().cloned())
    }

    /// Request id echoed by the last response, or `""` if none was recorded.
    ///
    /// Nested calls issued on a [`Context::child`] (such as the app ticket
    /// re-send) do not overwrite it.
    pub fn request_id(&self) -> String {
        self.get_as::<String>(KEY_REQUEST_ID).unwrap_or_default()
    }

    /// HTTP status of the last response, or `0` if none was recorded.
    pub fn http_status_code(&self) -> u16 {
        self.get_as::<u16>(KEY_HTTP_STATUS_CODE).unwrap_or_default()
    }
}
