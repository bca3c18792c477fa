//! The pipeline driver.
//!
//! ```text
//!  init ─► validate ─┬─► build ─► sign ─► transport ─► validate_response ─► decode ─► retry ─┐
//!     (abort on err) │                                                                     │
//!                    └──────────────── while retryable && attempts <= max_retry_count ◄────┘
//!                                                   │
//!                                                   ▼
//!                                             complement   (always, exactly once)
//! ```
//!
//! One call runs sequentially on the caller's task. The complement stage may
//! issue a nested ticket-refresh request through the same driver before
//! control returns to the caller.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, info_span, Instrument};

use crate::config::Config;
use crate::context::{KEY_HTTP_STATUS_CODE, KEY_REQUEST_ID};
use crate::errors::Error;
use crate::handlers::Handlers;
use crate::ports::{CredentialProvider, Transport};
use crate::request::Request;
use crate::Context;

/// Boxed `Send` future returned by [`Pipeline::execute`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Immutable pipeline: configuration, stage set, and collaborators.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Config>,
    handlers: Handlers,
    credentials: Arc<dyn CredentialProvider>,
    transport: Arc<dyn Transport>,
}

impl Pipeline {
    /// Creates a pipeline with the default stage set.
    pub fn new(
        config: Config,
        credentials: Arc<dyn CredentialProvider>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            handlers: Handlers::default(),
            credentials,
            transport,
        }
    }

    /// Replaces the stage set.
    #[must_use]
    pub fn with_handlers(mut self, handlers: Handlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The stage set, e.g. as a base for substituting a single stage.
    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    pub fn credentials(&self) -> &dyn CredentialProvider {
        self.credentials.as_ref()
    }

    /// Executes `req` to completion.
    ///
    /// The outcome is left on the request: [`Request::err`] on failure, the
    /// output slot on success. The complement stage runs exactly once after
    /// everything else, including when a stage panics; the panic is resumed
    /// afterwards.
    pub fn execute<'a>(&'a self, ctx: &'a Context, req: &'a mut Request) -> BoxFuture<'a, ()> {
        let span = info_span!("oapi.request", method = %req.method, path = %req.path);
        Box::pin(
            async move {
                let outcome = AssertUnwindSafe(self.run(ctx, &mut *req))
                    .catch_unwind()
                    .await;
                // Temporary body files are released before any nested call.
                req.body = None;
                req.call = None;
                req.response = None;
                self.handlers.complement.handle(self, ctx, req).await;
                if let Err(panic) = outcome {
                    std::panic::resume_unwind(panic);
                }
            }
            .instrument(span),
        )
    }

    async fn run(&self, ctx: &Context, req: &mut Request) {
        self.handlers.init.handle(self, ctx, req).await;
        if req.err.is_some() {
            return;
        }
        self.handlers.validate.handle(self, ctx, req).await;
        if req.err.is_some() {
            return;
        }
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.send(ctx, req).await;
            if !req.retryable || attempt > self.config.max_retry_count {
                return;
            }
            debug!(
                attempt,
                error = ?req.err,
                "retrying request"
            );
            req.err = None;
        }
    }

    /// One attempt followed by the retry classification.
    async fn send(&self, ctx: &Context, req: &mut Request) {
        self.attempt(ctx, req).await;
        self.handlers.retry.handle(self, ctx, req).await;
    }

    async fn attempt(&self, ctx: &Context, req: &mut Request) {
        self.handlers.build.handle(self, ctx, req).await;
        if req.err.is_some() {
            return;
        }
        self.handlers.sign.handle(self, ctx, req).await;
        if req.err.is_some() {
            return;
        }
        let Some(call) = req.call.take() else {
            req.err = Some(Error::NoOutgoingCall { stage: "transport" });
            return;
        };
        let resp = match self.transport.send(ctx, call).await {
            Ok(resp) => resp,
            Err(err) => {
                req.err = Some(err.into());
                return;
            }
        };
        ctx.set(
            KEY_REQUEST_ID,
            resp.headers.get(KEY_REQUEST_ID).unwrap_or_default().to_string(),
        );
        ctx.set(KEY_HTTP_STATUS_CODE, resp.status);
        req.response = Some(resp);

        self.handlers.validate_response.handle(self, ctx, req).await;
        if req.err.is_some() {
            return;
        }
        self.handlers.decode.handle(self, ctx, req).await;
    }
}
