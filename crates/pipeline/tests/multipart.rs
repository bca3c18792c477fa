mod common;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pipeline::handlers::BuildStage;
use pipeline::{
    AccessTokenType, BodySource, Context, Error, FormData, FormFile, Handlers, IncomingResponse,
    Input, Method, Pipeline, Request, Stage, TransportError,
};

use common::*;

#[derive(Debug, PartialEq)]
struct Part {
    name: Option<String>,
    file_name: Option<String>,
    content_type: Option<String>,
    data: Vec<u8>,
}

async fn parse_multipart(content_type: &str, body: Vec<u8>) -> Vec<Part> {
    let boundary = multer::parse_boundary(content_type).expect("boundary in content type");
    let stream = futures::stream::once(async move { Ok::<Bytes, std::io::Error>(Bytes::from(body)) });
    let mut multipart = multer::Multipart::new(stream, boundary);
    let mut parts = Vec::new();
    while let Some(field) = multipart.next_field().await.expect("well-formed multipart") {
        parts.push(Part {
            name: field.name().map(str::to_string),
            file_name: field.file_name().map(str::to_string),
            content_type: field.content_type().map(ToString::to_string),
            data: field.bytes().await.expect("part body").to_vec(),
        });
    }
    parts
}

fn upload_form(file_bytes: &[u8]) -> FormData {
    FormData::new()
        .with_param("image_type", "message")
        .with_param("width", 640)
        .with_file(
            FormFile::from_stream(std::io::Cursor::new(file_bytes.to_vec()))
                .with_field_name("image")
                .with_file_name("cat.png")
                .with_content_type("image/png"),
        )
}

fn expected_parts(file_bytes: &[u8]) -> Vec<Part> {
    vec![
        Part {
            name: Some("image_type".into()),
            file_name: None,
            content_type: None,
            data: b"message".to_vec(),
        },
        Part {
            name: Some("width".into()),
            file_name: None,
            content_type: None,
            data: b"640".to_vec(),
        },
        Part {
            name: Some("image".into()),
            file_name: Some("cat.png".into()),
            content_type: Some("image/png".into()),
            data: file_bytes.to_vec(),
        },
    ]
}

#[tokio::test]
async fn streamed_form_reproduces_fields_then_files() {
    let file_bytes: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
    let transport = StubTransport::always_json(r#"{"code":0,"msg":"ok"}"#);
    let pipeline = pipeline(internal_config(), transport.clone());
    let mut req = Request::new(Method::Post, "/open-apis/image/v4/put", &[AccessTokenType::Tenant])
        .with_input(Input::Form(upload_form(&file_bytes)));

    pipeline.execute(&Context::new(), &mut req).await;

    assert!(req.err.is_none(), "unexpected error: {:?}", req.err);
    let call = &transport.calls()[0];
    let content_type = call.headers.get("Content-Type").expect("content type");
    assert!(content_type.starts_with("multipart/form-data; boundary="));
    let parts = parse_multipart(content_type, call.body.clone()).await;
    assert_eq!(parts, expected_parts(&file_bytes));
}

#[tokio::test]
async fn in_memory_form_parses_the_same_way() {
    let form = FormData::new()
        .with_param("a", "1")
        .with_file(FormFile::from_bytes(b"hello".to_vec()).with_file_name("h.txt"));
    let transport = StubTransport::always_json(r#"{"code":0,"msg":"ok"}"#);
    let pipeline = pipeline(internal_config(), transport.clone());
    let mut req = Request::unauthenticated(Method::Post, "/upload").with_input(Input::Form(form));

    pipeline.execute(&Context::new(), &mut req).await;

    let call = &transport.calls()[0];
    let parts = parse_multipart(call.headers.get("content-type").expect("ct"), call.body.clone()).await;
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].data, b"1");
    assert_eq!(parts[1].name.as_deref(), Some("file"));
    assert_eq!(parts[1].content_type.as_deref(), Some("application/octet-stream"));
    assert_eq!(parts[1].data, b"hello");
}

#[tokio::test]
async fn streamed_form_is_replayed_identically_on_retry() {
    let file_bytes = b"retry me".to_vec();
    let seen = Arc::new(AtomicUsize::new(0));
    let transport = {
        let seen = Arc::clone(&seen);
        StubTransport::new(move |_, _| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(json_response(r#"{"code":99991663,"msg":"tenant access token invalid"}"#))
            } else {
                Ok(json_response(r#"{"code":0,"msg":"ok"}"#))
            }
        })
    };
    let pipeline = pipeline(internal_config(), transport.clone());
    let mut req = Request::new(Method::Post, "/upload", &[AccessTokenType::Tenant])
        .with_input(Input::Form(upload_form(&file_bytes)));

    pipeline.execute(&Context::new(), &mut req).await;

    assert!(req.err.is_none(), "unexpected error: {:?}", req.err);
    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].body, calls[1].body);
    assert_eq!(
        calls[0].headers.get("content-type"),
        calls[1].headers.get("content-type")
    );
    let parts = parse_multipart(calls[1].headers.get("content-type").expect("ct"), calls[1].body.clone()).await;
    assert_eq!(parts, expected_parts(&file_bytes));
    // The temporary body file is gone once the call returns.
    assert!(req.body.is_none());
}

/// Default build stage that remembers every temporary body file it produced.
#[derive(Default)]
struct TempPathRecorder {
    paths: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl Stage for TempPathRecorder {
    async fn handle(&self, pipeline: &Pipeline, ctx: &Context, req: &mut Request) {
        BuildStage.handle(pipeline, ctx, req).await;
        if let Some(BodySource::TempFile { path, .. }) = &req.body {
            self.paths.lock().push(path.to_path_buf());
        }
    }
}

async fn run_failing_upload(transport: Arc<StubTransport>) -> (Request, Vec<PathBuf>) {
    let recorder = Arc::new(TempPathRecorder::default());
    let handlers = Handlers {
        build: recorder.clone(),
        ..Handlers::default()
    };
    let pipeline = pipeline(internal_config(), transport).with_handlers(handlers);
    let mut req = Request::new(Method::Post, "/upload", &[AccessTokenType::Tenant])
        .with_input(Input::Form(upload_form(b"never accepted")));

    pipeline.execute(&Context::new(), &mut req).await;

    let paths = recorder.paths.lock().clone();
    (req, paths)
}

#[tokio::test]
async fn temp_body_file_is_removed_after_a_transport_failure() {
    let transport = StubTransport::new(|_, _| {
        Err(TransportError::Connection("connection refused".to_string()))
    });

    let (req, paths) = run_failing_upload(transport).await;

    assert!(matches!(
        req.err,
        Some(Error::Transport(TransportError::Connection(_)))
    ));
    assert!(req.body.is_none());
    assert_eq!(paths.len(), 1);
    assert!(!paths[0].exists(), "{} was left behind", paths[0].display());
}

#[tokio::test]
async fn temp_body_file_is_removed_after_a_rejected_response() {
    let transport = StubTransport::new(|_, _| {
        Ok(IncomingResponse::from_bytes(
            502,
            [("Content-Type", "text/html")].into_iter().collect(),
            b"<html>bad gateway</html>".to_vec(),
        ))
    });

    let (req, paths) = run_failing_upload(transport).await;

    assert!(matches!(req.err, Some(Error::InvalidResponse(_))));
    assert!(req.body.is_none());
    assert_eq!(paths.len(), 1);
    assert!(!paths[0].exists(), "{} was left behind", paths[0].display());
}

#[tokio::test]
async fn temp_body_file_is_removed_after_exhausting_retries() {
    let transport =
        StubTransport::always_json(r#"{"code":99991663,"msg":"tenant access token invalid"}"#);

    let (req, paths) = run_failing_upload(transport.clone()).await;

    assert_eq!(transport.calls().len(), 2);
    assert!(req.err.as_ref().and_then(Error::as_api).is_some());
    assert!(req.body.is_none());
    // Built once, replayed from the same file.
    assert_eq!(paths.len(), 2);
    assert_eq!(paths[0], paths[1]);
    assert!(!paths[0].exists(), "{} was left behind", paths[0].display());
}
