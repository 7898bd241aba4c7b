use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};

use crate::{
    AppState,
    api::models::security::{
        BootstrapTokenRequest, BootstrapTokenValidation, LockoutStatus, RecoveryTokenResponse, ResetLockoutRequest, SecurityStatus,
    },
    auth::{
        cookies::read_cookie,
        engine::is_open_mode,
        identity::{AuthMethod, Identity},
    },
    errors::{Error, Result},
    net::{client_ip::ClientIp, is_private_or_reserved},
};

/// Failed-attempt state for a username or client IP
#[utoipa::path(
    get,
    path = "/api/security/lockout/{identifier}",
    tag = "security",
    params(("identifier" = String, Path, description = "Username or client IP")),
    responses(
        (status = 200, description = "Lockout state", body = LockoutStatus),
        (status = 403, description = "Admin privileges required"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_lockout(State(state): State<AppState>, Path(identifier): Path<String>) -> Json<LockoutStatus> {
    let info = state.lockout.info(&identifier);
    Json(LockoutStatus::new(identifier, info))
}

/// Clear failed attempts and any lock for an identifier
#[utoipa::path(
    post,
    path = "/api/security/reset-lockout",
    request_body = ResetLockoutRequest,
    tag = "security",
    responses(
        (status = 200, description = "Lockout cleared", body = LockoutStatus),
        (status = 400, description = "Missing identifier"),
        (status = 403, description = "Admin privileges required"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn reset_lockout(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<ResetLockoutRequest>,
) -> Result<Json<LockoutStatus>> {
    let identifier = request.identifier.trim();
    if identifier.is_empty() {
        return Err(Error::BadRequest {
            message: "identifier is required".to_string(),
        });
    }
    state.lockout.reset(identifier);
    tracing::info!(identifier = identifier, reset_by = %identity.username, "Lockout reset by administrator");
    Ok(Json(LockoutStatus::new(identifier, state.lockout.info(identifier))))
}

/// Issue a single-use recovery token
#[utoipa::path(
    post,
    path = "/api/security/recovery-tokens",
    tag = "security",
    responses(
        (status = 201, description = "Recovery token issued; returned only once", body = RecoveryTokenResponse),
        (status = 403, description = "Admin privileges required"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn create_recovery_token(State(state): State<AppState>, identity: Identity) -> (StatusCode, Json<RecoveryTokenResponse>) {
    let (token, expires_at) = state.recovery.generate(state.config.security.recovery_token_ttl);
    tracing::info!(issued_by = %identity.username, expires_at = %expires_at, "Recovery token issued");
    (StatusCode::CREATED, Json(RecoveryTokenResponse { token, expires_at }))
}

/// Check a first-run setup token without consuming it
#[utoipa::path(
    post,
    path = "/api/security/validate-bootstrap-token",
    request_body = BootstrapTokenRequest,
    tag = "security",
    responses(
        (status = 200, description = "Token is valid", body = BootstrapTokenValidation),
        (status = 400, description = "Setup has already been completed"),
        (status = 401, description = "Token is invalid"),
        (status = 500, description = "Bootstrap token could not be initialized"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn validate_bootstrap_token(
    State(state): State<AppState>,
    client: ClientIp,
    Json(request): Json<BootstrapTokenRequest>,
) -> Result<Json<BootstrapTokenValidation>> {
    if !is_open_mode(&state) {
        return Err(Error::BadRequest {
            message: "Authentication is already configured".to_string(),
        });
    }
    let bootstrap = state.bootstrap.as_ref().ok_or_else(|| Error::Internal {
        operation: "validate bootstrap token: token was not initialized".to_string(),
    })?;

    if bootstrap.validate(request.token.trim()) {
        tracing::info!(client_ip = %client.ip, "Bootstrap token validated");
        Ok(Json(BootstrapTokenValidation { valid: true }))
    } else {
        state.lockout.record_failure(&client.ip.to_string());
        tracing::warn!(client_ip = %client.ip, "Invalid bootstrap token presented");
        Err(Error::Unauthenticated {
            message: Some("Invalid bootstrap token".to_string()),
        })
    }
}

/// Public summary of which mechanisms are configured.
///
/// Only the session cookie is consulted. API tokens are never checked here: this endpoint sits
/// outside the auth engine, so probing it would bypass lockout accounting.
#[utoipa::path(
    get,
    path = "/api/security/status",
    tag = "security",
    responses(
        (status = 200, description = "Security posture", body = SecurityStatus),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn security_status(State(state): State<AppState>, client: ClientIp, headers: HeaderMap) -> Json<SecurityStatus> {
    let auth = &state.config.auth;
    let open = is_open_mode(&state);

    let auth_method = read_cookie(&headers, &auth.session.cookie_name)
        .and_then(|id| state.sessions.validate_session(&id))
        .map(|session| AuthMethod::from(session.source));

    Json(SecurityStatus {
        requires_auth: !open,
        password_configured: auth.password_enabled(),
        api_token_configured: !state.tokens.is_empty(),
        proxy_auth_configured: auth.proxy_enabled(),
        oidc_enabled: auth.oidc_enabled,
        saml_enabled: auth.saml_enabled,
        has_https: client.secure,
        client_ip: client.ip.to_string(),
        is_private_network: is_private_or_reserved(client.ip),
        via_trusted_proxy: client.via_trusted_proxy,
        authenticated: auth_method.is_some(),
        auth_method,
        bootstrap_token_path: open
            .then(|| state.bootstrap.as_ref().map(|b| b.path().display().to_string()))
            .flatten(),
    })
}

#[cfg(test)]
mod tests {
    use crate::auth::bootstrap::BootstrapToken;
    use crate::auth::session::{NewSession, SessionSource};
    use crate::auth::tokens::{ApiTokenRecord, SCOPE_MONITORING_READ};
    use crate::test_utils::{create_test_config, create_test_state, test_server};
    use axum::http::StatusCode;
    use serde_json::{Value, json};
    use std::sync::Arc;

    fn admin_state() -> crate::AppState {
        let state = create_test_state(create_test_config());
        state
            .tokens
            .insert(ApiTokenRecord::new("admin-token", "admin", vec!["*".to_string()]).unwrap())
            .unwrap();
        state
    }

    #[tokio::test]
    async fn test_lockout_query_and_reset() {
        let state = admin_state();
        for _ in 0..5 {
            state.lockout.record_failure("alice");
        }
        let server = test_server(state.clone());

        let response = server
            .get("/api/security/lockout/alice")
            .add_header("x-api-token", "admin-token")
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["identifier"], "alice");
        assert_eq!(body["locked"], true);
        assert_eq!(body["attempts"], 5);

        let reset = server
            .post("/api/security/reset-lockout")
            .add_header("x-api-token", "admin-token")
            .json(&json!({"identifier": "alice"}))
            .await;
        reset.assert_status_ok();
        let body: Value = reset.json();
        assert_eq!(body["locked"], false);
        assert_eq!(body["attempts"], 0);
        assert!(!state.lockout.is_locked("alice"));

        let blank = server
            .post("/api/security/reset-lockout")
            .add_header("x-api-token", "admin-token")
            .json(&json!({"identifier": "  "}))
            .await;
        blank.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_recovery_token_grants_single_admin_request() {
        let server = test_server(admin_state());

        let issued = server
            .post("/api/security/recovery-tokens")
            .add_header("x-api-token", "admin-token")
            .await;
        issued.assert_status(StatusCode::CREATED);
        let body: Value = issued.json();
        let token = body["token"].as_str().unwrap().to_string();

        let first = server.get("/api/security/tokens").add_header("x-recovery-token", token.clone()).await;
        first.assert_status_ok();
        assert_eq!(first.header("x-auth-method"), "recovery");

        let second = server.get("/api/security/tokens").add_header("x-recovery-token", token).await;
        second.assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_bootstrap_validation() {
        let mut state = create_test_state(create_test_config());
        state.bootstrap = Some(Arc::new(BootstrapToken::from_raw("setup-token", "/data/.bootstrap_token".into())));
        let server = test_server(state);

        let valid = server
            .post("/api/security/validate-bootstrap-token")
            .json(&json!({"token": "setup-token"}))
            .await;
        valid.assert_status_ok();
        let body: Value = valid.json();
        assert_eq!(body["valid"], true);

        let invalid = server
            .post("/api/security/validate-bootstrap-token")
            .json(&json!({"token": "guess"}))
            .await;
        invalid.assert_status(StatusCode::UNAUTHORIZED);

        // Validation does not consume the token
        server
            .post("/api/security/validate-bootstrap-token")
            .json(&json!({"token": "setup-token"}))
            .await
            .assert_status_ok();
    }

    #[tokio::test]
    async fn test_bootstrap_missing_in_open_mode_is_misconfiguration() {
        let server = test_server(create_test_state(create_test_config()));
        let response = server
            .post("/api/security/validate-bootstrap-token")
            .json(&json!({"token": "anything"}))
            .await;
        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_bootstrap_rejected_once_configured() {
        let server = test_server(admin_state());
        let response = server
            .post("/api/security/validate-bootstrap-token")
            .json(&json!({"token": "anything"}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_open_mode_exposes_bootstrap_path() {
        let mut state = create_test_state(create_test_config());
        state.bootstrap = Some(Arc::new(BootstrapToken::from_raw("setup-token", "/data/.bootstrap_token".into())));
        let server = test_server(state);

        let body: Value = server.get("/api/security/status").await.json();
        assert_eq!(body["requires_auth"], false);
        assert_eq!(body["bootstrap_token_path"], "/data/.bootstrap_token");
        assert_eq!(body["authenticated"], false);
    }

    #[tokio::test]
    async fn test_status_never_validates_tokens() {
        let state = admin_state();
        let reader = state
            .tokens
            .insert(ApiTokenRecord::new("reader", "reader", vec![SCOPE_MONITORING_READ.to_string()]).unwrap())
            .unwrap();
        let server = test_server(state.clone());

        let via_query: Value = server.get("/api/security/status?token=reader").await.json();
        assert_eq!(via_query["requires_auth"], true);
        assert_eq!(via_query["authenticated"], false);
        assert!(via_query.get("bootstrap_token_path").is_none());

        let via_header: Value = server.get("/api/security/status").add_header("x-api-token", "reader").await.json();
        assert_eq!(via_header["authenticated"], false);
        assert!(via_header.get("auth_method").is_none());
        assert!(state.tokens.get(&reader.id).unwrap().last_used_at.is_none());
    }

    #[tokio::test]
    async fn test_status_reports_session() {
        let state = admin_state();
        let session = state.sessions.create_session(NewSession {
            username: "admin".to_string(),
            is_admin: true,
            source: SessionSource::Password,
            user_agent: None,
            client_ip: None,
        });
        let server = test_server(state);

        let body: Value = server
            .get("/api/security/status")
            .add_header("cookie", format!("pulse_session={session}"))
            .await
            .json();
        assert_eq!(body["authenticated"], true);
        assert_eq!(body["auth_method"], "session");
    }
}
