//! Stage contract and the default stage set.
//!
//! A stage is a function of the execution context and the mutable request
//! record with no return value. It reports failure by setting
//! [`Request::err`]. Stages are fields of [`Handlers`], so a test or an
//! embedding application can substitute any of them without touching the
//! driver.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};
use url::Url;

use crate::body;
use crate::config::{APPLY_APP_TICKET_PATH, CONTENT_TYPE_JSON, HEADER_CONTENT_TYPE};
use crate::driver::Pipeline;
use crate::errors::Error;
use crate::ports::{Body, Headers, Method, OutgoingCall};
use crate::request::{AccessTokenType, Input, Request};
use crate::response::Output;
use crate::Context;

/// One step of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    async fn handle(&self, pipeline: &Pipeline, ctx: &Context, req: &mut Request);
}

#[async_trait]
impl<F> Stage for F
where
    F: Fn(&Context, &mut Request) + Send + Sync,
{
    async fn handle(&self, _pipeline: &Pipeline, ctx: &Context, req: &mut Request) {
        self(ctx, req);
    }
}

/// The stage set the driver runs.
///
/// `init` and `validate` run once; `build` through `decode` make up one
/// attempt; `retry` classifies each attempt; `complement` runs once on exit.
#[derive(Clone)]
pub struct Handlers {
    pub init: Arc<dyn Stage>,
    pub validate: Arc<dyn Stage>,
    pub build: Arc<dyn Stage>,
    pub sign: Arc<dyn Stage>,
    pub validate_response: Arc<dyn Stage>,
    pub decode: Arc<dyn Stage>,
    pub retry: Arc<dyn Stage>,
    pub complement: Arc<dyn Stage>,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            init: Arc::new(InitStage),
            validate: Arc::new(ValidateStage),
            build: Arc::new(BuildStage),
            sign: Arc::new(SignStage),
            validate_response: Arc::new(ValidateResponseStage),
            decode: Arc::new(DecodeStage),
            retry: Arc::new(RetryStage),
            complement: Arc::new(TicketRecoveryStage),
        }
    }
}

// ---------------------------------------------------------------------------
// init / validate
// ---------------------------------------------------------------------------

/// Resolves the request path and option-driven credential class.
pub struct InitStage;

#[async_trait]
impl Stage for InitStage {
    async fn handle(&self, _pipeline: &Pipeline, _ctx: &Context, req: &mut Request) {
        if let Err(err) = req.init() {
            req.err = Some(err);
        }
    }
}

/// Checks the credential class against the request's accessible set and,
/// for ISV apps, the identifiers tenant and user calls need.
pub struct ValidateStage;

#[async_trait]
impl Stage for ValidateStage {
    async fn handle(&self, pipeline: &Pipeline, _ctx: &Context, req: &mut Request) {
        if let Err(err) = validate(pipeline, req) {
            req.err = Some(err);
        }
    }
}

fn validate(pipeline: &Pipeline, req: &Request) -> Result<(), Error> {
    if req.access_token_type == AccessTokenType::None {
        return Ok(());
    }
    if !req.accessible_token_types.contains(&req.access_token_type) {
        return Err(Error::AccessTokenTypeInvalid);
    }
    if pipeline.config().app_settings.is_isv() {
        match req.access_token_type {
            AccessTokenType::Tenant if req.tenant_key.is_empty() => {
                return Err(Error::TenantKeyEmpty)
            }
            AccessTokenType::User if req.user_access_token.is_empty() => {
                return Err(Error::UserAccessTokenEmpty)
            }
            _ => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// build / sign
// ---------------------------------------------------------------------------

/// Materialises the body on the first attempt and assembles the outgoing call.
pub struct BuildStage;

#[async_trait]
impl Stage for BuildStage {
    async fn handle(&self, pipeline: &Pipeline, _ctx: &Context, req: &mut Request) {
        if let Err(err) = build(pipeline, req).await {
            req.err = Some(err);
        }
    }
}

async fn build(pipeline: &Pipeline, req: &mut Request) -> Result<(), Error> {
    // A retry re-sends the body already materialised for this call.
    if !req.retryable {
        if let Some((source, content_type)) = body::materialize(&mut req.input).await? {
            debug!(
                method = %req.method,
                path = %req.path,
                content_type = %content_type,
                form = matches!(req.input, Input::Form(_)),
                "request body built"
            );
            req.body = Some(source);
            req.content_type = content_type;
        }
    }
    let body = match req.body.as_mut() {
        Some(source) => source.next_body().await?,
        None => Body::Empty,
    };

    let config = pipeline.config();
    let path = req.resolved_path.as_deref().unwrap_or(&req.path);
    let mut url = Url::parse(&config.domain)?.join(path)?;
    if !req.query_params.is_empty() {
        url.query_pairs_mut().extend_pairs(
            req.query_params
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
    }

    let mut headers: Headers = config.default_headers.iter().cloned().collect();
    if !req.content_type.is_empty() {
        headers.set(HEADER_CONTENT_TYPE, req.content_type.clone());
    }
    req.call = Some(OutgoingCall {
        method: req.method,
        url: url.into(),
        headers,
        body,
    });
    Ok(())
}

/// Attaches the bearer credential for the request's credential class.
pub struct SignStage;

#[async_trait]
impl Stage for SignStage {
    async fn handle(&self, pipeline: &Pipeline, ctx: &Context, req: &mut Request) {
        let Some(call) = req.call.take() else {
            req.err = Some(Error::NoOutgoingCall { stage: "sign" });
            return;
        };
        let credentials = pipeline.credentials();
        let signed = match req.access_token_type {
            AccessTokenType::None => Ok(call),
            AccessTokenType::App => credentials.attach_app_token(ctx, call).await,
            AccessTokenType::Tenant => {
                credentials
                    .attach_tenant_token(ctx, call, &req.tenant_key)
                    .await
            }
            AccessTokenType::User => {
                credentials
                    .attach_user_token(ctx, call, &req.user_access_token)
                    .await
            }
        };
        match signed {
            Ok(call) => req.call = Some(call),
            Err(err) => req.err = Some(err),
        }
    }
}

// ---------------------------------------------------------------------------
// validate_response / decode
// ---------------------------------------------------------------------------

/// Checks status (stream outputs) or content type (envelope outputs).
pub struct ValidateResponseStage;

#[async_trait]
impl Stage for ValidateResponseStage {
    async fn handle(&self, _pipeline: &Pipeline, _ctx: &Context, req: &mut Request) {
        let is_stream = req.output.is_stream();
        let Some(resp) = req.response.as_mut() else {
            req.err = Some(Error::InvalidResponse("no response received".to_string()));
            return;
        };
        if is_stream {
            if resp.status != 200 {
                req.err = Some(Error::StreamStatus(resp.status));
            }
            return;
        }
        let content_type = resp.headers.get(HEADER_CONTENT_TYPE).unwrap_or_default().to_string();
        if content_type.contains(CONTENT_TYPE_JSON) {
            return;
        }
        req.err = Some(match resp.read_body().await {
            Ok(body) => Error::InvalidResponse(format!(
                "content-type: {content_type}, is not: {CONTENT_TYPE_JSON}, \
                 if is stream, please register a stream output, body: {}",
                String::from_utf8_lossy(&body)
            )),
            Err(err) => Error::Io(err),
        });
    }
}

/// Copies stream responses into the sink or decodes the JSON envelope.
pub struct DecodeStage;

#[async_trait]
impl Stage for DecodeStage {
    async fn handle(&self, _pipeline: &Pipeline, _ctx: &Context, req: &mut Request) {
        if let Err(err) = decode(req).await {
            req.err = Some(err);
        }
    }
}

async fn decode(req: &mut Request) -> Result<(), Error> {
    let Some(mut resp) = req.response.take() else {
        return Err(Error::InvalidResponse("no response received".to_string()));
    };
    match &mut req.output {
        Output::Stream(sink) => {
            let copied = tokio::io::copy(&mut resp.body, sink).await?;
            sink.flush().await?;
            debug!(path = %req.path, bytes = copied, "stream response copied");
            Ok(())
        }
        Output::Json(decoder) => {
            let body = resp.read_body().await?;
            debug!(
                path = %req.path,
                body = %String::from_utf8_lossy(&body),
                "response received"
            );
            decoder.decode(&body)
        }
    }
}

// ---------------------------------------------------------------------------
// retry / complement
// ---------------------------------------------------------------------------

/// Sets [`Request::retryable`] from the attempt's error.
pub struct RetryStage;

#[async_trait]
impl Stage for RetryStage {
    async fn handle(&self, _pipeline: &Pipeline, _ctx: &Context, req: &mut Request) {
        req.retryable = req
            .err
            .as_ref()
            .is_some_and(|err| err.retry_policy().is_retryable());
    }
}

/// Issues an app ticket re-send when the call failed because the ticket is
/// invalid or missing. The request error is left untouched.
pub struct TicketRecoveryStage;

#[async_trait]
impl Stage for TicketRecoveryStage {
    async fn handle(&self, pipeline: &Pipeline, ctx: &Context, req: &mut Request) {
        if !req.ticket_recovery || !needs_ticket_refresh(req.err.as_ref()) {
            return;
        }
        info!(path = %req.path, "app ticket invalid or missing, requesting a re-send");
        let mut refresh = match apply_app_ticket_request(pipeline) {
            Ok(refresh) => refresh,
            Err(err) => {
                error!(error = %err, "failed to build app ticket request");
                return;
            }
        };
        // Own value map, so the caller keeps the failed call's request id and status.
        let refresh_ctx = ctx.child();
        pipeline.execute(&refresh_ctx, &mut refresh).await;
        if let Some(err) = refresh.err.as_ref() {
            error!(error = %err, "app ticket re-send failed");
        }
    }
}

fn needs_ticket_refresh(err: Option<&Error>) -> bool {
    match err {
        Some(Error::Api(api)) => api.is_app_ticket_invalid(),
        Some(Error::AppTicketEmpty) => true,
        _ => false,
    }
}

/// The ticket re-send request. Built with ticket recovery disabled so a
/// failing re-send never triggers another one.
fn apply_app_ticket_request(pipeline: &Pipeline) -> Result<Request, Error> {
    let settings = &pipeline.config().app_settings;
    let input = Input::json(&json!({
        "app_id": settings.app_id,
        "app_secret": settings.app_secret,
    }))?;
    Ok(Request::unauthenticated(Method::Post, APPLY_APP_TICKET_PATH)
        .with_input(input)
        .with_output(Output::no_data())
        .without_ticket_recovery())
}
