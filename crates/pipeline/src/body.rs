//! Request body materialisation.
//!
//! The body is built once per call, on the first attempt, and kept as a
//! [`BodySource`] on the request. Each attempt asks the source for a fresh
//! [`Body`]: in-memory bodies are cloned; file-backed bodies are rewound to
//! offset zero, reopening the backing file by path when the previous attempt
//! consumed the handle.
//!
//! Multipart forms containing a streamed file are written to a temporary file
//! instead of memory. The file is removed when the [`BodySource`] is dropped.

use std::io::SeekFrom;

use tempfile::TempPath;
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DEFAULT_CONTENT_TYPE;
use crate::errors::Error;
use crate::ports::Body;
use crate::request::{escape_quotes, FileContent, FormData, Input};

const TEMP_FILE_PREFIX: &str = ".oapisdk";

/// A materialised request body that can be replayed on retry.
#[derive(Debug)]
pub enum BodySource {
    Memory(Vec<u8>),
    /// Multipart body spooled to disk. `file` is `None` after an attempt has
    /// handed the open handle to the transport.
    TempFile {
        path: TempPath,
        file: Option<tokio::fs::File>,
    },
}

impl BodySource {
    /// Returns the body for the next attempt, positioned at offset zero.
    pub async fn next_body(&mut self) -> Result<Body, Error> {
        match self {
            BodySource::Memory(bytes) => Ok(Body::Bytes(bytes.clone())),
            BodySource::TempFile { path, file } => {
                let mut handle = match file.take() {
                    Some(handle) => handle,
                    None => {
                        warn!(path = %path.display(), "body stream was consumed, reopening backing file");
                        tokio::fs::File::open(&*path).await?
                    }
                };
                handle.seek(SeekFrom::Start(0)).await?;
                Ok(Body::File(handle))
            }
        }
    }

    /// Returns `true` if the body lives in a temporary file.
    pub fn is_file_backed(&self) -> bool {
        matches!(self, BodySource::TempFile { .. })
    }
}

/// Materialises `input` into a body source and its content type.
///
/// Returns `None` for [`Input::None`]. File streams in a form are read to the
/// end, so this must only run once per call.
pub async fn materialize(input: &mut Input) -> Result<Option<(BodySource, String)>, Error> {
    match input {
        Input::None => Ok(None),
        Input::Raw(s) => Ok(Some((
            BodySource::Memory(s.as_bytes().to_vec()),
            DEFAULT_CONTENT_TYPE.to_string(),
        ))),
        Input::Json(value) => {
            let bytes = serde_json::to_vec(value).map_err(Error::Encode)?;
            Ok(Some((BodySource::Memory(bytes), DEFAULT_CONTENT_TYPE.to_string())))
        }
        Input::Form(form) => build_form_body(form).await.map(Some),
    }
}

/// Encodes `form` as `multipart/form-data`.
///
/// Forms with any streamed file are spooled to a temporary file; all others
/// are built in memory.
pub async fn build_form_body(form: &mut FormData) -> Result<(BodySource, String), Error> {
    let boundary = Uuid::new_v4().simple().to_string();
    if form.has_stream() {
        let (file, path) = tempfile::Builder::new()
            .prefix(TEMP_FILE_PREFIX)
            .tempfile()?
            .into_parts();
        let writer = MultipartWriter::new(
            BufWriter::new(tokio::fs::File::from_std(file)),
            boundary,
        );
        let content_type = writer.content_type();
        let file = write_form(writer, form).await?.into_inner();
        debug!(path = %path.display(), "multipart body spooled to temporary file");
        Ok((
            BodySource::TempFile {
                path,
                file: Some(file),
            },
            content_type,
        ))
    } else {
        let writer = MultipartWriter::new(Vec::new(), boundary);
        let content_type = writer.content_type();
        let bytes = write_form(writer, form).await?;
        Ok((BodySource::Memory(bytes), content_type))
    }
}

async fn write_form<W: AsyncWrite + Unpin>(
    mut writer: MultipartWriter<W>,
    form: &mut FormData,
) -> Result<W, Error> {
    for (key, value) in &form.params {
        writer.write_field(key, value).await?;
    }
    for file in &mut form.files {
        writer.begin_part(&file.part_headers()).await?;
        match &mut file.content {
            FileContent::Bytes(bytes) => writer.inner.write_all(bytes).await?,
            FileContent::Stream(stream) => {
                tokio::io::copy(stream, &mut writer.inner).await?;
            }
        }
    }
    Ok(writer.finish().await?)
}

/// Minimal `multipart/form-data` encoder over any async writer.
struct MultipartWriter<W> {
    inner: W,
    boundary: String,
    parts: usize,
}

impl<W: AsyncWrite + Unpin> MultipartWriter<W> {
    fn new(inner: W, boundary: String) -> Self {
        Self {
            inner,
            boundary,
            parts: 0,
        }
    }

    fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    async fn begin_part(&mut self, headers: &[(String, String)]) -> std::io::Result<()> {
        let mut head = String::new();
        if self.parts > 0 {
            head.push_str("\r\n");
        }
        head.push_str("--");
        head.push_str(&self.boundary);
        head.push_str("\r\n");
        for (name, value) in headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        self.parts += 1;
        self.inner.write_all(head.as_bytes()).await
    }

    async fn write_field(&mut self, name: &str, value: &str) -> std::io::Result<()> {
        let disposition = format!("form-data; name=\"{}\"", escape_quotes(name));
        self.begin_part(&[("Content-Disposition".to_string(), disposition)])
            .await?;
        self.inner.write_all(value.as_bytes()).await
    }

    async fn finish(mut self) -> std::io::Result<W> {
        let tail = if self.parts > 0 {
            format!("\r\n--{}--\r\n", self.boundary)
        } else {
            format!("--{}--\r\n", self.boundary)
        };
        self.inner.write_all(tail.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(self.inner)
    }
}
