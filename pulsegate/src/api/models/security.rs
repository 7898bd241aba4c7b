//! Lockout, recovery, bootstrap and status models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::identity::AuthMethod;
use crate::auth::lockout::LockoutInfo;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LockoutStatus {
    pub identifier: String,
    pub attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub locked: bool,
}

impl LockoutStatus {
    pub fn new(identifier: impl Into<String>, info: LockoutInfo) -> Self {
        Self {
            identifier: identifier.into(),
            attempts: info.attempts,
            locked_until: info.locked_until,
            locked: info.locked,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResetLockoutRequest {
    /// Username or client IP
    pub identifier: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RecoveryTokenResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BootstrapTokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BootstrapTokenValidation {
    pub valid: bool,
}

/// Public summary of the gateway's security posture
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SecurityStatus {
    /// At least one authentication mechanism is active
    pub requires_auth: bool,
    pub password_configured: bool,
    pub api_token_configured: bool,
    pub proxy_auth_configured: bool,
    pub oidc_enabled: bool,
    pub saml_enabled: bool,
    /// The request arrived over confirmed HTTPS
    pub has_https: bool,
    pub client_ip: String,
    pub is_private_network: bool,
    /// The immediate peer is a configured trusted proxy
    pub via_trusted_proxy: bool,
    /// Whether the caller presented a valid session cookie
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<AuthMethod>,
    /// Location of the first-run setup token, only while no mechanism is configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootstrap_token_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}
