//! One evaluator per credential mechanism.
//!
//! Each evaluator inspects a request for its own kind of credential and answers:
//!
//! - `None`: no credential of this kind is present, try the next mechanism
//! - `Some(Ok(identity))`: the credential is valid
//! - `Some(Err(error))`: a credential was presented and rejected
//!
//! The [`AuthEngine`](super::engine::AuthEngine) runs them in a fixed precedence order.

use axum::http::{HeaderMap, header, request::Parts};

use super::bootstrap::SETUP_TOKEN_HEADER;
use super::cookies::read_cookie;
use super::identity::{AuthMethod, Identity};
use super::password::{basic_credentials, verify_credentials};
use super::recovery::RECOVERY_TOKEN_HEADER;
use super::tokens::ADMIN_SCOPE;
use crate::AppState;
use crate::crypto;
use crate::errors::Error;
use crate::net::client_ip::ClientIp;
use crate::redact::redacted;

/// Organization assumed when a request names none
pub const DEFAULT_ORG: &str = "default";

/// Query parameter carrying an API token on WebSocket handshakes
pub const TOKEN_QUERY_PARAM: &str = "token";

pub trait CredentialEvaluator: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, parts: &Parts, state: &AppState, client: &ClientIp) -> Option<Result<Identity, Error>>;

    /// Whether a rejected credential of this kind counts against the client IP's lockout ledger
    fn records_ip_failures(&self) -> bool {
        true
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn rejected(message: &str) -> Option<Result<Identity, Error>> {
    Some(Err(Error::Unauthenticated {
        message: Some(message.to_string()),
    }))
}

/// One-shot setup token, only consulted in open mode
#[derive(Debug, Default)]
pub struct BootstrapEvaluator;

impl CredentialEvaluator for BootstrapEvaluator {
    fn name(&self) -> &'static str {
        "bootstrap"
    }

    fn evaluate(&self, parts: &Parts, state: &AppState, _client: &ClientIp) -> Option<Result<Identity, Error>> {
        let presented = header_value(&parts.headers, SETUP_TOKEN_HEADER)?;
        let Some(bootstrap) = state.bootstrap.as_ref() else {
            return Some(Err(Error::Internal {
                operation: "validate setup token: bootstrap token is not initialized".to_string(),
            }));
        };
        if bootstrap.validate(presented) {
            Some(Ok(Identity::new("bootstrap", AuthMethod::Bootstrap, true)))
        } else {
            rejected("Invalid setup token")
        }
    }
}

/// Administrator-issued single-use recovery token
#[derive(Debug, Default)]
pub struct RecoveryEvaluator;

impl CredentialEvaluator for RecoveryEvaluator {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn evaluate(&self, parts: &Parts, state: &AppState, client: &ClientIp) -> Option<Result<Identity, Error>> {
        let presented = header_value(&parts.headers, RECOVERY_TOKEN_HEADER)?;
        if state.recovery.redeem(presented, &client.ip.to_string()) {
            Some(Ok(Identity::new("recovery", AuthMethod::Recovery, true)))
        } else {
            rejected("Invalid or already used recovery token")
        }
    }
}

/// Identity asserted by a reverse proxy holding the shared secret
#[derive(Debug, Default)]
pub struct ProxyEvaluator;

impl CredentialEvaluator for ProxyEvaluator {
    fn name(&self) -> &'static str {
        "proxy"
    }

    fn evaluate(&self, parts: &Parts, state: &AppState, _client: &ClientIp) -> Option<Result<Identity, Error>> {
        let auth = &state.config.auth;
        let secret = auth.proxy.secret.as_deref().filter(|s| !s.is_empty())?;
        let presented = header_value(&parts.headers, &auth.proxy.secret_header)?;

        if !crypto::constant_time_eq(presented, secret) {
            tracing::warn!(provided = %redacted(presented), "Invalid proxy auth secret");
            return rejected("Invalid proxy secret");
        }

        let Some(username) = auth
            .proxy
            .user_header
            .as_deref()
            .and_then(|name| header_value(&parts.headers, name))
        else {
            return rejected("Proxy did not supply a username");
        };

        let is_admin = match (auth.proxy.role_header.as_deref(), auth.proxy.admin_role.as_deref()) {
            (Some(role_header), Some(admin_role)) => header_value(&parts.headers, role_header).is_some_and(|roles| {
                roles
                    .split(auth.proxy.role_separator.as_str())
                    .map(str::trim)
                    .any(|role| role == admin_role)
            }),
            // Without a role scheme every proxied user is an administrator
            _ => true,
        };

        Some(Ok(Identity::new(username, AuthMethod::Proxy, is_admin)))
    }
}

/// Where an API token was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Header,
    Bearer,
    Query,
}

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = header_value(headers, header::AUTHORIZATION.as_str())?;
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim()).filter(|t| !t.is_empty())
}

fn query_token(parts: &Parts) -> Option<String> {
    let query = parts.uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == TOKEN_QUERY_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Locate an API token: configured header, then `Authorization: Bearer`, then the query string.
pub fn find_api_token(parts: &Parts, token_header: &str) -> Option<(String, TokenSource)> {
    if let Some(token) = header_value(&parts.headers, token_header) {
        return Some((token.to_string(), TokenSource::Header));
    }
    if let Some(token) = bearer_token(&parts.headers) {
        return Some((token.to_string(), TokenSource::Bearer));
    }
    query_token(parts).map(|token| (token, TokenSource::Query))
}

/// Opaque API token with scopes and optional organization binding
#[derive(Debug, Default)]
pub struct ApiTokenEvaluator;

impl CredentialEvaluator for ApiTokenEvaluator {
    fn name(&self) -> &'static str {
        "api_token"
    }

    fn evaluate(&self, parts: &Parts, state: &AppState, _client: &ClientIp) -> Option<Result<Identity, Error>> {
        let auth = &state.config.auth;
        let (token, source) = find_api_token(parts, &auth.api_token_header)?;

        // Query strings end up in access logs and browser history; only WebSocket handshakes
        // have no other place to carry a credential
        if source == TokenSource::Query && !is_websocket_upgrade(&parts.headers) {
            tracing::warn!(path = %parts.uri.path(), "Rejected API token supplied in query string on non-WebSocket request");
            return rejected("API tokens in the query string are only accepted for WebSocket upgrades");
        }

        let Some(record) = state.tokens.validate(&token) else {
            tracing::debug!(provided = %redacted(&token), "Invalid API token");
            return rejected("Invalid API token");
        };

        let org_id = header_value(&parts.headers, &auth.org_header).unwrap_or(DEFAULT_ORG);
        if !record.allows_org(org_id) {
            tracing::warn!(token_id = %record.id, org_id = org_id, "API token not authorized for organization");
            return Some(Err(Error::AccessDenied {
                org_id: org_id.to_string(),
            }));
        }

        let mut identity = Identity::new(format!("token:{}", record.id), AuthMethod::ApiToken, record.has_scope(ADMIN_SCOPE));
        identity.token_id = Some(record.id.clone());
        identity.scopes = record.effective_scopes();
        identity.org_id = Some(org_id.to_string());
        Some(Ok(identity))
    }
}

/// HTTP Basic username and password
#[derive(Debug, Default)]
pub struct BasicEvaluator;

impl CredentialEvaluator for BasicEvaluator {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn evaluate(&self, parts: &Parts, state: &AppState, client: &ClientIp) -> Option<Result<Identity, Error>> {
        let auth = &state.config.auth;
        if !auth.password_enabled() {
            return None;
        }
        let (username, password) = basic_credentials(&parts.headers)?;
        let ip = client.ip.to_string();

        for key in [username.as_str(), ip.as_str()] {
            let info = state.lockout.info(key);
            if let (true, Some(locked_until)) = (info.locked, info.locked_until) {
                return Some(Err(Error::Locked { locked_until }));
            }
        }

        match verify_credentials(auth, &username, &password) {
            Ok(true) => {
                state.lockout.clear(&username);
                state.lockout.clear(&ip);
                let is_admin = auth.basic_auth_grants_admin && !auth.proxy_roles_enabled();
                Some(Ok(Identity::new(username, AuthMethod::Basic, is_admin)))
            }
            Ok(false) => {
                state.lockout.record_failure(&username);
                let info = state.lockout.record_failure(&ip);
                tracing::warn!(user = %username, client_ip = %ip, attempts = info.attempts, "Basic authentication failed");
                match (info.locked, info.locked_until) {
                    (true, Some(locked_until)) => Some(Err(Error::Locked { locked_until })),
                    _ => rejected("Invalid credentials"),
                }
            }
            Err(e) => Some(Err(e)),
        }
    }

    fn records_ip_failures(&self) -> bool {
        false
    }
}

/// Session cookie minted by login or an SSO flow
#[derive(Debug, Default)]
pub struct SessionEvaluator;

impl CredentialEvaluator for SessionEvaluator {
    fn name(&self) -> &'static str {
        "session"
    }

    fn evaluate(&self, parts: &Parts, state: &AppState, _client: &ClientIp) -> Option<Result<Identity, Error>> {
        let session_id = read_cookie(&parts.headers, &state.config.auth.session.cookie_name)?;
        let Some(session) = state.sessions.validate_and_extend(&session_id) else {
            tracing::debug!(session = %redacted(&session_id), "Session expired or unknown");
            return rejected("Session expired or invalid");
        };
        Some(Ok(Identity::new(session.username, AuthMethod::from(session.source), session.is_admin)))
    }

    fn records_ip_failures(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::session::{NewSession, SessionSource};
    use crate::auth::tokens::{ApiTokenRecord, SCOPE_MONITORING_READ, SCOPE_SETTINGS_WRITE};
    use crate::test_utils::{basic_header, create_test_config, create_test_state, fast_hash};
    use axum::http::Request;
    use std::net::IpAddr;

    fn client() -> ClientIp {
        let ip: IpAddr = "198.51.100.20".parse().unwrap();
        ClientIp {
            ip,
            peer: ip,
            via_trusted_proxy: false,
            secure: false,
        }
    }

    fn parts(uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn state_with_token(raw: &str, scopes: &[&str], org_ids: &[&str]) -> AppState {
        let state = create_test_state(create_test_config());
        let mut record = ApiTokenRecord::new(raw, "test", scopes.iter().map(|s| s.to_string()).collect()).unwrap();
        record.org_ids = org_ids.iter().map(|s| s.to_string()).collect();
        state.tokens.insert(record).unwrap();
        state
    }

    #[test]
    fn test_api_token_header_and_bearer() {
        let state = state_with_token("tok-123", &[SCOPE_MONITORING_READ], &[]);

        let via_header = ApiTokenEvaluator.evaluate(&parts("/api/x", &[("x-api-token", "tok-123")]), &state, &client());
        let identity = via_header.unwrap().unwrap();
        assert_eq!(identity.method, AuthMethod::ApiToken);
        assert!(identity.username.starts_with("token:"));
        assert!(!identity.is_admin);

        let via_bearer = ApiTokenEvaluator.evaluate(&parts("/api/x", &[("authorization", "Bearer tok-123")]), &state, &client());
        assert!(via_bearer.unwrap().is_ok());

        assert!(ApiTokenEvaluator.evaluate(&parts("/api/x", &[]), &state, &client()).is_none());
    }

    #[test]
    fn test_query_token_requires_websocket_upgrade() {
        let state = state_with_token("tok-ws", &["*"], &[]);

        let plain = ApiTokenEvaluator.evaluate(&parts("/api/ws?token=tok-ws", &[]), &state, &client());
        assert!(matches!(plain, Some(Err(Error::Unauthenticated { .. }))));

        let upgrade = ApiTokenEvaluator.evaluate(
            &parts("/api/ws?token=tok-ws", &[("upgrade", "WebSocket"), ("connection", "Upgrade")]),
            &state,
            &client(),
        );
        assert!(upgrade.unwrap().is_ok());

        // The header path works regardless of upgrade status
        let header = ApiTokenEvaluator.evaluate(&parts("/api/ws", &[("x-api-token", "tok-ws")]), &state, &client());
        assert!(header.unwrap().is_ok());
    }

    #[test]
    fn test_token_org_binding() {
        let state = state_with_token("tok-org", &["*"], &["acme"]);

        let allowed = ApiTokenEvaluator.evaluate(
            &parts("/api/x", &[("x-api-token", "tok-org"), ("x-pulse-org-id", "acme")]),
            &state,
            &client(),
        );
        assert_eq!(allowed.unwrap().unwrap().org_id.as_deref(), Some("acme"));

        let denied = ApiTokenEvaluator.evaluate(
            &parts("/api/x", &[("x-api-token", "tok-org"), ("x-pulse-org-id", "globex")]),
            &state,
            &client(),
        );
        assert!(matches!(denied, Some(Err(Error::AccessDenied { org_id })) if org_id == "globex"));

        // No org header means the default org, which a bound token does not cover
        let default = ApiTokenEvaluator.evaluate(&parts("/api/x", &[("x-api-token", "tok-org")]), &state, &client());
        assert!(matches!(default, Some(Err(Error::AccessDenied { .. }))));
    }

    #[test]
    fn test_settings_write_token_is_admin() {
        let state = state_with_token("tok-admin", &[SCOPE_SETTINGS_WRITE], &[]);
        let identity = ApiTokenEvaluator
            .evaluate(&parts("/api/x", &[("x-api-token", "tok-admin")]), &state, &client())
            .unwrap()
            .unwrap();
        assert!(identity.is_admin);
        assert_eq!(identity.scopes, vec![SCOPE_SETTINGS_WRITE]);
    }

    fn proxy_config(role_header: Option<&str>) -> crate::config::Config {
        let mut config = create_test_config();
        config.auth.proxy.secret = Some("proxy-secret".to_string());
        config.auth.proxy.user_header = Some("X-Remote-User".to_string());
        if let Some(role_header) = role_header {
            config.auth.proxy.role_header = Some(role_header.to_string());
            config.auth.proxy.admin_role = Some("admin".to_string());
        }
        config
    }

    #[test]
    fn test_proxy_secret_and_roles() {
        let state = create_test_state(proxy_config(Some("X-Remote-Roles")));

        let admin = ProxyEvaluator.evaluate(
            &parts(
                "/",
                &[
                    ("x-proxy-secret", "proxy-secret"),
                    ("x-remote-user", "alice"),
                    ("x-remote-roles", "viewer | admin"),
                ],
            ),
            &state,
            &client(),
        );
        let admin = admin.unwrap().unwrap();
        assert_eq!(admin.username, "alice");
        assert!(admin.is_admin);

        let viewer = ProxyEvaluator.evaluate(
            &parts(
                "/",
                &[
                    ("x-proxy-secret", "proxy-secret"),
                    ("x-remote-user", "bob"),
                    ("x-remote-roles", "viewer|administrator"),
                ],
            ),
            &state,
            &client(),
        );
        assert!(!viewer.unwrap().unwrap().is_admin);

        // Missing role header fails closed
        let no_roles = ProxyEvaluator.evaluate(
            &parts("/", &[("x-proxy-secret", "proxy-secret"), ("x-remote-user", "carol")]),
            &state,
            &client(),
        );
        assert!(!no_roles.unwrap().unwrap().is_admin);

        let wrong_secret = ProxyEvaluator.evaluate(
            &parts("/", &[("x-proxy-secret", "nope"), ("x-remote-user", "mallory")]),
            &state,
            &client(),
        );
        assert!(matches!(wrong_secret, Some(Err(_))));

        let no_user = ProxyEvaluator.evaluate(&parts("/", &[("x-proxy-secret", "proxy-secret")]), &state, &client());
        assert!(matches!(no_user, Some(Err(_))));
    }

    #[test]
    fn test_proxy_without_role_scheme_is_admin() {
        let state = create_test_state(proxy_config(None));
        let identity = ProxyEvaluator
            .evaluate(
                &parts("/", &[("x-proxy-secret", "proxy-secret"), ("x-remote-user", "alice")]),
                &state,
                &client(),
            )
            .unwrap()
            .unwrap();
        assert!(identity.is_admin);
    }

    #[test]
    fn test_basic_records_failures_and_locks() {
        let mut config = create_test_config();
        config.auth.username = Some("admin".to_string());
        config.auth.password_hash = Some(fast_hash("s3cret"));
        config.security.lockout.max_failed_attempts = 2;
        let state = create_test_state(config);

        let bad = parts("/", &[("authorization", &basic_header("admin", "wrong"))]);
        assert!(matches!(
            BasicEvaluator.evaluate(&bad, &state, &client()),
            Some(Err(Error::Unauthenticated { .. }))
        ));
        assert!(matches!(
            BasicEvaluator.evaluate(&bad, &state, &client()),
            Some(Err(Error::Locked { .. }))
        ));

        // Correct credentials are refused while locked
        let good = parts("/", &[("authorization", &basic_header("admin", "s3cret"))]);
        assert!(matches!(
            BasicEvaluator.evaluate(&good, &state, &client()),
            Some(Err(Error::Locked { .. }))
        ));

        state.lockout.reset("admin");
        state.lockout.reset(&client().ip.to_string());
        let identity = BasicEvaluator.evaluate(&good, &state, &client()).unwrap().unwrap();
        assert_eq!(identity.method, AuthMethod::Basic);
        assert!(identity.is_admin);
    }

    #[test]
    fn test_basic_admin_flag_follows_config() {
        let mut config = create_test_config();
        config.auth.username = Some("admin".to_string());
        config.auth.password_hash = Some(fast_hash("s3cret"));
        config.auth.basic_auth_grants_admin = false;
        let state = create_test_state(config);

        let good = parts("/", &[("authorization", &basic_header("admin", "s3cret"))]);
        assert!(!BasicEvaluator.evaluate(&good, &state, &client()).unwrap().unwrap().is_admin);
    }

    #[test]
    fn test_session_cookie() {
        let state = create_test_state(create_test_config());
        let id = state.sessions.create_session(NewSession {
            username: "sso-user".to_string(),
            is_admin: false,
            source: SessionSource::Oidc,
            user_agent: None,
            client_ip: None,
        });

        let cookie = format!("pulse_session={id}");
        let identity = SessionEvaluator
            .evaluate(&parts("/", &[("cookie", &cookie)]), &state, &client())
            .unwrap()
            .unwrap();
        assert_eq!(identity.username, "sso-user");
        assert_eq!(identity.method, AuthMethod::Oidc);

        let stale = SessionEvaluator.evaluate(&parts("/", &[("cookie", "pulse_session=stale")]), &state, &client());
        assert!(matches!(stale, Some(Err(_))));
    }

    #[test]
    fn test_recovery_token_single_use() {
        let state = create_test_state(create_test_config());
        let (token, _) = state.recovery.generate(std::time::Duration::from_secs(60));
        let request = parts("/", &[("x-recovery-token", &token)]);

        let first = RecoveryEvaluator.evaluate(&request, &state, &client()).unwrap().unwrap();
        assert!(first.is_admin);
        assert!(matches!(RecoveryEvaluator.evaluate(&request, &state, &client()), Some(Err(_))));
    }
}
