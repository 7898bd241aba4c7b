//! The authenticated principal attached to each request.

use axum::{extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::session::SessionSource;
use crate::errors::Error;

/// Mechanism that authenticated the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Open mode, nothing configured
    None,
    /// Development admin bypass
    Bypass,
    Bootstrap,
    Recovery,
    Proxy,
    ApiToken,
    Basic,
    Session,
    Oidc,
    Saml,
}

impl AuthMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Bypass => "bypass",
            AuthMethod::Bootstrap => "bootstrap",
            AuthMethod::Recovery => "recovery",
            AuthMethod::Proxy => "proxy",
            AuthMethod::ApiToken => "api_token",
            AuthMethod::Basic => "basic",
            AuthMethod::Session => "session",
            AuthMethod::Oidc => "oidc",
            AuthMethod::Saml => "saml",
        }
    }
}

impl From<SessionSource> for AuthMethod {
    fn from(source: SessionSource) -> Self {
        match source {
            SessionSource::Password => AuthMethod::Session,
            SessionSource::Oidc => AuthMethod::Oidc,
            SessionSource::Saml => AuthMethod::Saml,
        }
    }
}

/// Who the request is acting as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Identity {
    pub username: String,
    pub method: AuthMethod,
    pub is_admin: bool,
    /// Set for API token identities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    /// Scopes held by an API token identity
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    /// Organization the request was authorized for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

impl Identity {
    pub fn new(username: impl Into<String>, method: AuthMethod, is_admin: bool) -> Self {
        Self {
            username: username.into(),
            method,
            is_admin,
            token_id: None,
            scopes: Vec::new(),
            org_id: None,
        }
    }

    /// Caller in open mode
    pub fn anonymous() -> Self {
        Self::new("anonymous", AuthMethod::None, true)
    }

    pub fn is_token(&self) -> bool {
        self.method == AuthMethod::ApiToken
    }

    /// Only API tokens are scope-limited; every other identity holds every scope
    pub fn has_scope(&self, scope: &str) -> bool {
        if !self.is_token() {
            return true;
        }
        super::tokens::scopes_grant(&self.scopes, scope)
    }
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<Identity>().cloned().ok_or_else(|| {
            tracing::trace!("No identity in request extensions");
            Error::Unauthenticated { message: None }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_token_identities_hold_every_scope() {
        let session = Identity::new("admin", AuthMethod::Session, false);
        assert!(session.has_scope("settings:write"));
    }

    #[test]
    fn test_token_scopes() {
        let mut token = Identity::new("token:1", AuthMethod::ApiToken, false);
        token.scopes = vec!["monitoring:read".to_string()];
        assert!(token.has_scope("monitoring:read"));
        assert!(!token.has_scope("settings:write"));

        token.scopes = vec!["*".to_string()];
        assert!(token.has_scope("settings:write"));
    }

    #[test]
    fn test_method_names_match_serde() {
        for method in [AuthMethod::ApiToken, AuthMethod::None, AuthMethod::Oidc] {
            let json = serde_json::to_value(method).unwrap();
            assert_eq!(json, method.as_str());
        }
    }

    #[tokio::test]
    async fn test_extractor_requires_identity() {
        let (mut parts, _) = axum::http::Request::new(()).into_parts();
        assert!(Identity::from_request_parts(&mut parts, &()).await.is_err());

        parts.extensions.insert(Identity::anonymous());
        let identity = Identity::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(identity.method, AuthMethod::None);
    }
}
