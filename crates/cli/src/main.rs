//! Open API client CLI entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Parse configuration**: assemble a [`pipeline::Config`] from flags and
//!    `OAPI_*` environment variables.
//! 2. **Wire observability**: install `tracing-subscriber` with an `EnvFilter`
//!    (`RUST_LOG`, default `info`) and an optional JSON formatter. Logs go to
//!    stderr so stdout carries only the response.
//! 3. **Construct infrastructure**: an [`http_transport::HttpTransport`] and a
//!    [`pipeline::StaticCredentials`] provider, injected into a
//!    [`pipeline::Pipeline`].
//! 4. **Execute one call** and print the decoded `data` as pretty JSON, or
//!    write a streamed response to `--output`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::{Parser, ValueEnum};
use http_transport::HttpTransport;
use pipeline::{
    AccessTokenType, AppSettings, Config, Context, Envelope, FormData, FormFile, Input, Method,
    Output, Pipeline, Request, StaticCredentials,
};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "oapi", version, about = "Execute one Open API call through the request pipeline")]
struct Args {
    /// Base URL of the Open API service
    #[arg(long, env = "OAPI_DOMAIN", default_value = "https://open.feishu.cn")]
    domain: String,

    #[arg(long, env = "OAPI_APP_ID", default_value = "")]
    app_id: String,

    #[arg(long, env = "OAPI_APP_SECRET", default_value = "", hide_env_values = true)]
    app_secret: String,

    /// Treat the app as a multi-tenant (ISV) app
    #[arg(long, env = "OAPI_ISV")]
    isv: bool,

    #[arg(long, env = "OAPI_APP_ACCESS_TOKEN", hide_env_values = true)]
    app_access_token: Option<String>,

    #[arg(long, env = "OAPI_TENANT_ACCESS_TOKEN", hide_env_values = true)]
    tenant_access_token: Option<String>,

    #[arg(long, env = "OAPI_USER_ACCESS_TOKEN", hide_env_values = true)]
    user_access_token: Option<String>,

    /// Tenant key for ISV tenant calls
    #[arg(long)]
    tenant_key: Option<String>,

    /// API path, e.g. /open-apis/im/v1/chats/:chat_id
    #[arg(long)]
    path: String,

    #[arg(long, default_value = "GET")]
    method: Method,

    /// Credential class the call is signed with
    #[arg(long, value_enum, default_value_t = TokenArg::Tenant)]
    token: TokenArg,

    /// JSON request body
    #[arg(long, conflicts_with_all = ["form", "file"])]
    data: Option<String>,

    /// Decode a flat envelope (data fields beside code/msg)
    #[arg(long)]
    flat: bool,

    /// Stream the response body into this file
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long = "query", value_name = "KEY=VALUE", value_parser = parse_pair)]
    query: Vec<(String, String)>,

    #[arg(long = "path-param", value_name = "KEY=VALUE", value_parser = parse_pair)]
    path_params: Vec<(String, String)>,

    /// Multipart form field
    #[arg(long = "form", value_name = "KEY=VALUE", value_parser = parse_pair)]
    form: Vec<(String, String)>,

    /// Multipart file part, streamed from disk
    #[arg(long = "file", value_name = "FIELD=PATH", value_parser = parse_pair)]
    file: Vec<(String, String)>,

    #[arg(long, env = "OAPI_MAX_RETRY_COUNT", default_value_t = pipeline::config::DEFAULT_MAX_RETRY_COUNT)]
    max_retry_count: u32,

    /// Overall deadline for the call, in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Emit logs as JSON lines
    #[arg(long, env = "OAPI_JSON_LOGS")]
    json_logs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TokenArg {
    None,
    App,
    Tenant,
    User,
}

impl From<TokenArg> for AccessTokenType {
    fn from(value: TokenArg) -> Self {
        match value {
            TokenArg::None => AccessTokenType::None,
            TokenArg::App => AccessTokenType::App,
            TokenArg::Tenant => AccessTokenType::Tenant,
            TokenArg::User => AccessTokenType::User,
        }
    }
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).try_init()?;
    }
    Ok(())
}

fn build_pipeline(args: &Args) -> anyhow::Result<Pipeline> {
    let settings = if args.isv {
        AppSettings::isv(&args.app_id, &args.app_secret)
    } else {
        AppSettings::internal(&args.app_id, &args.app_secret)
    };
    let config = Config::new(&args.domain, settings).with_max_retry_count(args.max_retry_count);

    let mut credentials = StaticCredentials::new();
    if let Some(token) = &args.app_access_token {
        credentials = credentials.with_app_access_token(token);
    }
    if let Some(token) = &args.tenant_access_token {
        credentials = credentials.with_tenant_access_token(token);
    }

    let transport = HttpTransport::new().context("failed to create HTTP transport")?;
    Ok(Pipeline::new(config, Arc::new(credentials), Arc::new(transport)))
}

async fn build_input(args: &Args) -> anyhow::Result<Input> {
    if !args.form.is_empty() || !args.file.is_empty() {
        let mut form = FormData::new();
        for (key, value) in &args.form {
            form = form.with_param(key, value);
        }
        for (field, path) in &args.file {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open `{path}`"))?;
            let name = Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.clone());
            form = form.with_file(
                FormFile::from_stream(file)
                    .with_field_name(field)
                    .with_file_name(name),
            );
        }
        return Ok(Input::Form(form));
    }
    match &args.data {
        Some(data) => {
            let value: serde_json::Value =
                serde_json::from_str(data).context("--data is not valid JSON")?;
            Ok(Input::Json(value))
        }
        None => Ok(Input::None),
    }
}

async fn build_request(args: &Args) -> anyhow::Result<Request> {
    let mut req = Request::new(args.method, &args.path, &[args.token.into()])
        .with_input(build_input(args).await?);
    for (key, value) in &args.path_params {
        req = req.with_path_param(key, value);
    }
    for (key, value) in &args.query {
        req = req.with_query_param(key, value);
    }
    if let Some(tenant_key) = &args.tenant_key {
        req = req.with_tenant_key(tenant_key);
    }
    if args.token == TokenArg::User {
        let Some(token) = &args.user_access_token else {
            bail!("--token user requires --user-access-token");
        };
        req = req.with_user_access_token(token);
    }

    let output = match &args.output {
        Some(path) => {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("failed to create `{}`", path.display()))?;
            Output::stream(file)
        }
        None if args.flat => Output::json::<serde_json::Value>(Envelope::Flat),
        None => Output::json::<serde_json::Value>(Envelope::Wrapped),
    };
    Ok(req.with_output(output))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs)?;

    let pipeline = build_pipeline(&args)?;
    let mut req = build_request(&args).await?;
    let ctx = match args.timeout_secs {
        Some(secs) => Context::new().with_timeout(Duration::from_secs(secs)),
        None => Context::new(),
    };

    pipeline.execute(&ctx, &mut req).await;
    info!(
        request_id = %ctx.request_id(),
        status = ctx.http_status_code(),
        "call finished"
    );

    if let Some(path) = &args.output {
        if let Some(err) = req.err.take() {
            return Err(err).context("request failed");
        }
        info!(path = %path.display(), "response written");
        return Ok(());
    }

    let data = req.take_result::<serde_json::Value>().context("request failed")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&data.unwrap_or(serde_json::Value::Null))?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_split_on_the_first_equals_sign() {
        assert_eq!(
            parse_pair("filter=a=b").expect("pair"),
            ("filter".to_string(), "a=b".to_string())
        );
        assert_eq!(parse_pair("empty=").expect("pair"), ("empty".to_string(), String::new()));
        assert!(parse_pair("novalue").is_err());
        assert!(parse_pair("=x").is_err());
    }

    #[test]
    fn flags_parse_into_a_request_shape() {
        let args = Args::try_parse_from([
            "oapi",
            "--path",
            "/open-apis/im/v1/chats/:chat_id",
            "--method",
            "post",
            "--token",
            "app",
            "--path-param",
            "chat_id=oc_1",
            "--query",
            "page_size=10",
            "--data",
            "{}",
            "--flat",
        ])
        .expect("parse");
        assert_eq!(args.method, Method::Post);
        assert_eq!(args.token, TokenArg::App);
        assert_eq!(args.path_params, vec![("chat_id".to_string(), "oc_1".to_string())]);
        assert!(args.flat);
    }

    #[test]
    fn data_conflicts_with_form_parts() {
        let parsed = Args::try_parse_from([
            "oapi", "--path", "/x", "--data", "{}", "--form", "k=v",
        ]);
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn user_class_requires_a_user_token() {
        let args = Args::try_parse_from(["oapi", "--path", "/x", "--token", "user"]).expect("parse");
        assert!(build_request(&args).await.is_err());
    }
}
