//! Fixed-token [`CredentialProvider`].
//!
//! Suitable for command-line use and tests where tokens are obtained out of
//! band. Applications that need token acquisition and caching supply their
//! own provider.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::errors::Error;
use crate::ports::{CredentialProvider, OutgoingCall};
use crate::Context;

/// Attaches pre-acquired tokens.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    app_access_token: Option<String>,
    tenant_access_token: Option<String>,
    tenant_access_tokens: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_app_access_token(mut self, token: impl Into<String>) -> Self {
        self.app_access_token = Some(token.into());
        self
    }

    /// Token used for tenant calls that carry no tenant key, or whose key has
    /// no dedicated token.
    #[must_use]
    pub fn with_tenant_access_token(mut self, token: impl Into<String>) -> Self {
        self.tenant_access_token = Some(token.into());
        self
    }

    /// Token for one tenant of an ISV app.
    #[must_use]
    pub fn with_tenant_key_token(
        mut self,
        tenant_key: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        self.tenant_access_tokens
            .insert(tenant_key.into(), token.into());
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn attach_app_token(
        &self,
        _ctx: &Context,
        call: OutgoingCall,
    ) -> Result<OutgoingCall, Error> {
        let token = self
            .app_access_token
            .as_deref()
            .ok_or_else(|| Error::Credential("no app access token configured".to_string()))?;
        Ok(call.with_bearer(token))
    }

    async fn attach_tenant_token(
        &self,
        _ctx: &Context,
        call: OutgoingCall,
        tenant_key: &str,
    ) -> Result<OutgoingCall, Error> {
        let token = self
            .tenant_access_tokens
            .get(tenant_key)
            .or(self.tenant_access_token.as_ref())
            .ok_or_else(|| {
                Error::Credential(format!(
                    "no tenant access token configured for tenant `{tenant_key}`"
                ))
            })?;
        Ok(call.with_bearer(token))
    }
}
