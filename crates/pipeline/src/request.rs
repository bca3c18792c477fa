//! The mutable execution record that flows through the pipeline stages.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use tokio::io::AsyncRead;

use crate::body::BodySource;
use crate::errors::Error;
use crate::ports::{IncomingResponse, Method, OutgoingCall};
use crate::response::{JsonOutput, Output, ResponseDecoder, ResponseSink};

/// Credential class a request needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessTokenType {
    None,
    App,
    Tenant,
    User,
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Contents of one file part.
pub enum FileContent {
    /// Content already in memory; the form may be built in memory too.
    Bytes(Vec<u8>),
    /// Read to the end while the body is built; forces a file-backed body.
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

/// A file part of a multipart form.
pub struct FormFile {
    field_name: String,
    file_name: String,
    content_type: String,
    pub(crate) content: FileContent,
}

impl FormFile {
    /// A file part named `file` with an `application/octet-stream` type.
    pub fn new(content: FileContent) -> Self {
        Self {
            field_name: "file".to_string(),
            file_name: "unknown-file".to_string(),
            content_type: "application/octet-stream".to_string(),
            content,
        }
    }

    /// A part whose content is already in memory.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(FileContent::Bytes(bytes.into()))
    }

    /// A part read from `stream` while the body is built.
    pub fn from_stream(stream: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::new(FileContent::Stream(Box::new(stream)))
    }

    /// Form field name, `file` by default.
    #[must_use]
    pub fn with_field_name(mut self, field_name: impl Into<String>) -> Self {
        self.field_name = field_name.into();
        self
    }

    /// File name sent in `Content-Disposition`, `unknown-file` by default.
    #[must_use]
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    /// Part content type, `application/octet-stream` by default.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// MIME headers written before this part's content.
    pub fn part_headers(&self) -> Vec<(String, String)> {
        vec![
            (
                "Content-Disposition".to_string(),
                format!(
                    "form-data; name=\"{}\"; filename=\"{}\"",
                    escape_quotes(&self.field_name),
                    escape_quotes(&self.file_name)
                ),
            ),
            ("Content-Type".to_string(), self.content_type.clone()),
        ]
    }

    /// Returns `true` when the content is streamed.
    pub fn is_stream(&self) -> bool {
        matches!(self.content, FileContent::Stream(_))
    }
}

pub(crate) fn escape_quotes(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Multipart form input: scalar fields then file parts, each in insertion order.
#[derive(Default)]
pub struct FormData {
    pub(crate) params: Vec<(String, String)>,
    pub(crate) files: Vec<FormFile>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    #[must_use]
    pub fn with_file(mut self, file: FormFile) -> Self {
        self.files.push(file);
        self
    }

    /// Returns `true` if any file is backed by a stream rather than bytes.
    pub fn has_stream(&self) -> bool {
        self.files.iter().any(FormFile::is_stream)
    }
}

impl fmt::Debug for FormData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormData")
            .field("params", &self.params)
            .field("files", &self.files.len())
            .finish()
    }
}

/// Request input. Exactly one variant is active.
#[derive(Debug, Default)]
pub enum Input {
    #[default]
    None,
    /// Sent verbatim.
    Raw(String),
    /// JSON-encoded during the build stage.
    Json(serde_json::Value),
    Form(FormData),
}

impl Input {
    /// Converts a serialisable value into [`Input::Json`].
    pub fn json<T: Serialize>(value: &T) -> Result<Self, Error> {
        serde_json::to_value(value)
            .map(Input::Json)
            .map_err(Error::Encode)
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// One attempted call, including nested ticket-refresh calls.
///
/// Stages communicate only by mutating this record. Setting [`Request::err`]
/// aborts the rest of the current attempt.
pub struct Request {
    pub method: Method,
    /// Path as given, possibly containing `:name` placeholders.
    pub path: String,
    /// Path with placeholders resolved; set by the init stage.
    pub resolved_path: Option<String>,
    pub path_params: Vec<(String, String)>,
    pub query_params: Vec<(String, String)>,

    pub access_token_type: AccessTokenType,
    pub accessible_token_types: HashSet<AccessTokenType>,
    pub tenant_key: String,
    pub user_access_token: String,

    pub input: Input,
    pub output: Output,

    /// Materialised body, kept across retries of this call.
    pub body: Option<BodySource>,
    pub content_type: String,
    /// The signed-or-unsigned call for the current attempt.
    pub call: Option<OutgoingCall>,
    pub response: Option<IncomingResponse>,

    /// Whether the last attempt may be re-sent. Only ever `true` while
    /// [`Request::err`] holds a retryable API error.
    pub retryable: bool,
    /// When `false`, the complement stage never issues a ticket refresh for
    /// this request. Refresh requests themselves are built this way.
    pub ticket_recovery: bool,
    pub err: Option<Error>,
}

impl Request {
    /// Creates a request needing credentials of one of `accessible` classes;
    /// the first listed class is the default. An empty list means no
    /// credentials.
    pub fn new(method: Method, path: impl Into<String>, accessible: &[AccessTokenType]) -> Self {
        let access_token_type = accessible.first().copied().unwrap_or(AccessTokenType::None);
        Self {
            method,
            path: path.into(),
            resolved_path: None,
            path_params: Vec::new(),
            query_params: Vec::new(),
            access_token_type,
            accessible_token_types: accessible.iter().copied().collect(),
            tenant_key: String::new(),
            user_access_token: String::new(),
            input: Input::None,
            output: Output::default(),
            body: None,
            content_type: String::new(),
            call: None,
            response: None,
            retryable: false,
            ticket_recovery: true,
            err: None,
        }
    }

    /// Creates a request that needs no credentials.
    pub fn unauthenticated(method: Method, path: impl Into<String>) -> Self {
        Self::new(method, path, &[])
    }

    #[must_use]
    pub fn with_input(mut self, input: Input) -> Self {
        self.input = input;
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: Output) -> Self {
        self.output = output;
        self
    }

    #[must_use]
    pub fn with_path_param(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.path_params.push((key.into(), value.to_string()));
        self
    }

    #[must_use]
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.query_params.push((key.into(), value.to_string()));
        self
    }

    #[must_use]
    pub fn with_tenant_key(mut self, tenant_key: impl Into<String>) -> Self {
        self.tenant_key = tenant_key.into();
        self
    }

    /// Sets a user access token; the init stage then switches the request to
    /// [`AccessTokenType::User`].
    #[must_use]
    pub fn with_user_access_token(mut self, token: impl Into<String>) -> Self {
        self.user_access_token = token.into();
        self
    }

    #[must_use]
    pub fn without_ticket_recovery(mut self) -> Self {
        self.ticket_recovery = false;
        self
    }

    /// Resolves `:name` placeholders and applies option-driven credential
    /// class changes.
    pub fn init(&mut self) -> Result<(), Error> {
        if !self.user_access_token.is_empty() {
            self.access_token_type = AccessTokenType::User;
        }
        self.resolved_path = Some(resolve_path(&self.path, &self.path_params)?);
        Ok(())
    }

    /// Returns the error, if any.
    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Takes the typed JSON output. `None` when the output is of another type
    /// or the response carried no data; a type mismatch leaves the slot in
    /// place.
    pub fn take_output<T: Send + 'static>(&mut self) -> Option<T> {
        match &self.output {
            Output::Json(decoder) if decoder.as_any().is::<JsonOutput<T>>() => {}
            _ => return None,
        }
        match std::mem::take(&mut self.output) {
            Output::Json(decoder) => ResponseDecoder::into_any(decoder)
                .downcast::<JsonOutput<T>>()
                .ok()
                .and_then(|slot| slot.into_value()),
            Output::Stream(_) => None,
        }
    }

    /// Takes back the stream sink registered with [`Output::stream`]. A type
    /// mismatch leaves the sink in place.
    pub fn take_sink<W: Send + 'static>(&mut self) -> Option<W> {
        match &self.output {
            // Deref to the trait object so the sink's own impl is dispatched.
            Output::Stream(sink) if (**sink).as_any().is::<W>() => {}
            _ => return None,
        }
        match std::mem::take(&mut self.output) {
            Output::Stream(sink) => ResponseSink::into_any(sink)
                .downcast::<W>()
                .ok()
                .map(|w| *w),
            Output::Json(_) => None,
        }
    }

    /// Consumes the error and JSON output of a finished request.
    pub fn take_result<T: Send + 'static>(&mut self) -> Result<Option<T>, Error> {
        match self.err.take() {
            Some(err) => Err(err),
            None => Ok(self.take_output()),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("access_token_type", &self.access_token_type)
            .field("retryable", &self.retryable)
            .field("err", &self.err)
            .finish_non_exhaustive()
    }
}

fn resolve_path(path: &str, params: &[(String, String)]) -> Result<String, Error> {
    let segments = path
        .split('/')
        .map(|segment| match segment.strip_prefix(':') {
            Some(name) => params
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| Error::PathParamMissing(name.to_string())),
            None => Ok(segment.to_string()),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Envelope;

    #[test]
    fn first_accessible_type_is_the_default() {
        let req = Request::new(
            Method::Get,
            "/x",
            &[AccessTokenType::Tenant, AccessTokenType::User],
        );
        assert_eq!(req.access_token_type, AccessTokenType::Tenant);
        assert_eq!(req.accessible_token_types.len(), 2);
        assert_eq!(
            Request::unauthenticated(Method::Get, "/x").access_token_type,
            AccessTokenType::None
        );
    }

    #[test]
    fn init_resolves_path_params() {
        let mut req = Request::unauthenticated(Method::Get, "/open-apis/chats/:chat_id/members")
            .with_path_param("chat_id", "oc_1");
        req.init().expect("init");
        assert_eq!(req.resolved_path.as_deref(), Some("/open-apis/chats/oc_1/members"));
    }

    #[test]
    fn init_fails_on_unresolved_placeholder() {
        let mut req = Request::unauthenticated(Method::Get, "/chats/:chat_id");
        let err = req.init().expect_err("missing param");
        assert!(matches!(err, Error::PathParamMissing(name) if name == "chat_id"));
    }

    #[test]
    fn user_access_token_switches_credential_class() {
        let mut req = Request::new(Method::Get, "/x", &[AccessTokenType::Tenant, AccessTokenType::User])
            .with_user_access_token("u-token");
        req.init().expect("init");
        assert_eq!(req.access_token_type, AccessTokenType::User);
    }

    #[test]
    fn take_output_requires_matching_type() {
        let mut req = Request::unauthenticated(Method::Get, "/x")
            .with_output(Output::json::<String>(Envelope::Wrapped));
        let Output::Json(decoder) = &mut req.output else {
            panic!("json output expected");
        };
        decoder
            .decode(br#"{"code":0,"msg":"ok","data":"hello"}"#)
            .expect("decode");

        assert_eq!(req.take_output::<u32>(), None);
        assert_eq!(req.take_output::<String>(), Some("hello".to_string()));
        assert_eq!(req.take_output::<String>(), None);
    }

    #[test]
    fn take_sink_with_the_wrong_type_keeps_the_sink() {
        let mut req = Request::unauthenticated(Method::Get, "/x")
            .with_output(Output::stream(vec![1u8, 2, 3]));
        assert!(req.take_sink::<tokio::io::Sink>().is_none());
        assert!(req.output.is_stream());
        assert_eq!(req.take_sink::<Vec<u8>>(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn take_sink_leaves_json_output_in_place() {
        let mut req = Request::unauthenticated(Method::Get, "/x")
            .with_output(Output::json::<String>(Envelope::Flat));
        assert!(req.take_sink::<Vec<u8>>().is_none());
        assert!(matches!(req.output, Output::Json(_)));
    }

    #[test]
    fn form_file_headers_escape_quotes() {
        let file = FormFile::from_bytes(b"x".to_vec())
            .with_field_name("image")
            .with_file_name("a\"b.png")
            .with_content_type("image/png");
        let headers = file.part_headers();
        assert_eq!(
            headers[0].1,
            "form-data; name=\"image\"; filename=\"a\\\"b.png\""
        );
        assert_eq!(headers[1].1, "image/png");
    }
}
