//! Application configuration.
//!
//! One [`AppConfig`] identifies a logical application: the API key scopes
//! requests to a project, the app name namespaces persisted records so two
//! apps in one process never contend over the same storage key.

use crate::error::AuthError;

/// Default app name used when none is given.
pub const DEFAULT_APP_NAME: &str = "[DEFAULT]";

/// Configuration for one logical application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Project API key.
    pub api_key: String,
    /// App name, defaults to `[DEFAULT]`.
    pub app_name: String,
    /// Tenant id for multi-tenant projects.
    pub tenant_id: Option<String>,
}

impl AppConfig {
    /// Create a validated config.
    pub fn new(api_key: impl Into<String>, app_name: Option<String>) -> Result<Self, AuthError> {
        let api_key = api_key.into();
        // Validate API key (error case first)
        if api_key.is_empty() {
            return Err(AuthError::internal("API key not configured"));
        }
        Ok(Self {
            api_key,
            app_name: app_name.unwrap_or_else(|| DEFAULT_APP_NAME.to_string()),
            tenant_id: None,
        })
    }

    /// Set the tenant id.
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}
