//! Immutable pipeline configuration.
//!
//! A [`Config`] is built once by the composition root and shared by `Arc`
//! between the driver and its stages. Nothing in this crate reads files or
//! environment variables; that is the caller's job.

use serde::{Deserialize, Serialize};

/// Header name for the content type.
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
/// Header name for the client identifier.
pub const HEADER_USER_AGENT: &str = "User-Agent";
/// Content type the response validator expects for envelope responses.
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// Content type set on JSON and raw string request bodies.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json; charset=utf-8";
/// Attempts beyond the first that the driver makes for retryable failures.
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 1;
/// Path of the app ticket re-send endpoint used by the complement stage.
pub const APPLY_APP_TICKET_PATH: &str = "/open-apis/auth/v3/app_ticket/resend";

/// Client identifier sent on every call.
pub fn user_agent() -> String {
    format!("oapi-sdk-rust/{}", env!("CARGO_PKG_VERSION"))
}

/// Deployment mode of the application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppType {
    /// Single-tenant app built by and for one organisation.
    #[default]
    Internal,
    /// Multi-tenant app distributed to many organisations. Tenant and user
    /// scoped calls must name the tenant or user they act for.
    Isv,
}

/// Application identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    /// App identifier issued by the platform.
    pub app_id: String,
    /// App secret; sent only in the app ticket re-send body.
    pub app_secret: String,
    /// Internal unless configured otherwise.
    #[serde(default)]
    pub app_type: AppType,
}

impl AppSettings {
    /// Settings for an internal (single-tenant) app.
    pub fn internal(app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            app_type: AppType::Internal,
        }
    }

    /// Settings for an ISV (multi-tenant) app.
    pub fn isv(app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_type: AppType::Isv,
            ..Self::internal(app_id, app_secret)
        }
    }

    /// Returns `true` for [`AppType::Isv`].
    pub fn is_isv(&self) -> bool {
        self.app_type == AppType::Isv
    }
}

/// Configuration consumed by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Base URL every request path is resolved against.
    pub domain: String,

    /// Identity used for validation and the app ticket re-send.
    pub app_settings: AppSettings,

    /// Extra attempts after the first for retryable API errors.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    /// Headers set on every outgoing call, in order.
    #[serde(default = "default_headers")]
    pub default_headers: Vec<(String, String)>,
}

fn default_max_retry_count() -> u32 {
    DEFAULT_MAX_RETRY_COUNT
}

fn default_headers() -> Vec<(String, String)> {
    vec![(HEADER_USER_AGENT.to_string(), user_agent())]
}

impl Config {
    /// Creates a configuration with the default retry count and headers.
    pub fn new(domain: impl Into<String>, app_settings: AppSettings) -> Self {
        Self {
            domain: domain.into(),
            app_settings,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            default_headers: default_headers(),
        }
    }

    /// Overrides the retry count.
    #[must_use]
    pub fn with_max_retry_count(mut self, max_retry_count: u32) -> Self {
        self.max_retry_count = max_retry_count;
        self
    }

    /// Adds or replaces a default header.
    #[must_use]
    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.default_headers
            .retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.default_headers.push((name, value.into()));
        self
    }
}
