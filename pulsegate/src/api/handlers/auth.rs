use axum::{
    Json,
    extract::State,
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
};

use crate::{
    AppState,
    api::models::auth::{LoginFailure, LoginResponse, LoginSuccess, LogoutResponse, LogoutSuccess},
    auth::{
        cookies::{CookieSettings, clear_cookie, csrf_cookie, read_cookie, session_cookie},
        identity::{AuthMethod, Identity},
        password::{basic_credentials, verify_credentials},
        session::{NewSession, SessionSource},
    },
    errors::Error,
    net::client_ip::ClientIp,
    redact::redacted,
};

fn lockout_failure(state: &AppState, username: &str, ip: &str) -> Option<Error> {
    [username, ip].into_iter().find_map(|key| {
        let info = state.lockout.info(key);
        match (info.locked, info.locked_until) {
            (true, Some(locked_until)) => Some(Error::Locked { locked_until }),
            _ => None,
        }
    })
}

/// Log in with HTTP Basic credentials and receive a session cookie
#[utoipa::path(
    post,
    path = "/api/login",
    tag = "authentication",
    responses(
        (status = 200, description = "Login successful, session and CSRF cookies set", body = LoginSuccess),
        (status = 400, description = "Password authentication is not configured"),
        (status = 401, description = "Invalid credentials or account locked", body = LoginFailure),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn login(State(state): State<AppState>, client: ClientIp, headers: HeaderMap) -> Result<Response, Error> {
    let auth = &state.config.auth;
    if !auth.password_enabled() {
        return Err(Error::BadRequest {
            message: "Password authentication is not configured".to_string(),
        });
    }
    let (username, password) = basic_credentials(&headers).ok_or_else(|| Error::Unauthenticated {
        message: Some("Missing credentials".to_string()),
    })?;
    let ip = client.ip.to_string();

    if let Some(locked) = lockout_failure(&state, &username, &ip) {
        tracing::warn!(user = %username, client_ip = %ip, "Login attempt while locked out");
        return Err(locked);
    }

    // Verify on a blocking thread to avoid stalling the runtime
    let auth_config = auth.clone();
    let verify_user = username.clone();
    let is_valid = tokio::task::spawn_blocking(move || verify_credentials(&auth_config, &verify_user, &password))
        .await
        .map_err(|e| Error::Internal {
            operation: format!("spawn password verification task: {e}"),
        })??;

    if !is_valid {
        let by_user = state.lockout.record_failure(&username);
        let by_ip = state.lockout.record_failure(&ip);
        let max_attempts = state.lockout.max_attempts();
        tracing::warn!(user = %username, client_ip = %ip, attempts = by_user.attempts, "Login failed");

        let locked_until = [by_user.locked_until, by_ip.locked_until].into_iter().flatten().max();
        if by_user.locked || by_ip.locked {
            return Ok(LoginFailure {
                error: "Too many failed attempts. Account temporarily locked.".to_string(),
                locked: true,
                locked_until,
                attempts: None,
                remaining: None,
                max_attempts: None,
            }
            .into_response());
        }
        return Ok(LoginFailure {
            error: "Invalid username or password".to_string(),
            locked: false,
            locked_until: None,
            attempts: Some(by_user.attempts),
            remaining: Some(max_attempts.saturating_sub(by_user.attempts)),
            max_attempts: Some(max_attempts),
        }
        .into_response());
    }

    state.lockout.clear(&username);
    state.lockout.clear(&ip);

    // A session ID the client arrived with must not survive authentication
    if let Some(previous) = read_cookie(&headers, &auth.session.cookie_name) {
        if state.sessions.delete_session(&previous).is_some() {
            tracing::debug!(session = %redacted(&previous), "Invalidated pre-login session");
        }
        state.csrf.remove(&previous);
    }

    let is_admin = auth.basic_auth_grants_admin && !auth.proxy_roles_enabled();
    let session_id = state.sessions.create_session(NewSession {
        username: username.clone(),
        is_admin,
        source: SessionSource::Password,
        user_agent: headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()).map(str::to_string),
        client_ip: Some(ip.clone()),
    });
    let expires_at = state
        .sessions
        .validate_session(&session_id)
        .map(|s| s.expires_at)
        .ok_or_else(|| Error::Internal {
            operation: "read back new session".to_string(),
        })?;
    let csrf_token = state.csrf.generate(&session_id);
    let settings = CookieSettings::for_client(&client);

    tracing::info!(user = %username, client_ip = %ip, session = %redacted(&session_id), "Login successful");

    Ok(LoginResponse {
        body: LoginSuccess {
            username,
            method: AuthMethod::Session,
            is_admin,
            expires_at,
        },
        session_cookie: session_cookie(&auth.session.cookie_name, &session_id, state.sessions.timeout(), settings),
        csrf_cookie: csrf_cookie(&auth.session.csrf_cookie_name, &csrf_token, settings),
        csrf_token: HeaderValue::from_str(&csrf_token).map_err(|e| Error::Internal {
            operation: format!("encode CSRF header: {e}"),
        })?,
    }
    .into_response())
}

/// End the current session
#[utoipa::path(
    post,
    path = "/api/logout",
    tag = "authentication",
    responses(
        (status = 200, description = "Logout successful, cookies cleared", body = LogoutSuccess),
        (status = 401, description = "Not authenticated"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn logout(State(state): State<AppState>, identity: Identity, client: ClientIp, headers: HeaderMap) -> LogoutResponse {
    let session = &state.config.auth.session;
    if let Some(session_id) = read_cookie(&headers, &session.cookie_name) {
        state.sessions.delete_session(&session_id);
        state.csrf.remove(&session_id);
        tracing::info!(user = %identity.username, session = %redacted(&session_id), "Logged out");
    }

    let settings = CookieSettings::for_client(&client);
    LogoutResponse {
        body: LogoutSuccess {
            message: "Logout successful".to_string(),
        },
        cleared: vec![
            clear_cookie(&session.cookie_name, true, settings),
            clear_cookie(&session.csrf_cookie_name, false, settings),
        ],
    }
}

/// The identity the request authenticated as
#[utoipa::path(
    get,
    path = "/api/me",
    tag = "authentication",
    responses(
        (status = 200, description = "Current identity", body = Identity),
        (status = 401, description = "Not authenticated"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn me(identity: Identity) -> Json<Identity> {
    Json(identity)
}
