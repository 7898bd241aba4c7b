//! CSRF double-submit tokens and the middleware that enforces them.
//!
//! A token is bound to exactly one session: the store keeps the digest of the latest token issued
//! for each session ID, so a token minted for session A never validates for session B.

use axum::{
    body::{Body, Bytes, to_bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method, header},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;

use super::cookies::{CookieSettings, csrf_cookie, read_cookie};
use crate::AppState;
use crate::crypto;
use crate::errors::{Error, RequestShape};
use crate::net::client_ip::client_of;
use crate::redact::redacted;

pub const CSRF_HEADER: &str = "x-csrf-token";
pub const CSRF_FORM_FIELD: &str = "csrf_token";

/// Largest form body buffered to look for a CSRF field
const MAX_FORM_BODY: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct CsrfStore {
    tokens: DashMap<String, String>,
}

impl CsrfStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh token for `session_id`, replacing any earlier one
    pub fn generate(&self, session_id: &str) -> String {
        let token = crypto::random_hex(32);
        self.tokens.insert(session_id.to_string(), crypto::sha256_hex(&token));
        token
    }

    pub fn validate(&self, session_id: &str, token: &str) -> bool {
        if session_id.is_empty() || token.is_empty() {
            return false;
        }
        self.tokens
            .get(session_id)
            .is_some_and(|stored| crypto::matches_sha256(token, stored.value()))
    }

    pub fn remove(&self, session_id: &str) {
        self.tokens.remove(session_id);
    }
}

/// Why a request skips the CSRF check, if it does
pub fn exemption(method: &Method, headers: &HeaderMap, api_token_header: &str) -> Option<&'static str> {
    if matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS) {
        return Some("safe method");
    }

    let has_token_header = headers
        .get(api_token_header)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| !v.trim().is_empty());
    if has_token_header {
        return Some("API token header");
    }

    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();
    if authorization.starts_with("basic ") {
        return Some("Basic auth header");
    }
    if authorization.starts_with("bearer ") {
        return Some("Bearer auth header");
    }
    None
}

fn query_token(request: &Request) -> Option<String> {
    let query = request.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == CSRF_FORM_FIELD)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
}

fn form_token(body: &Bytes) -> Option<String> {
    url::form_urlencoded::parse(body)
        .find(|(key, _)| key == CSRF_FORM_FIELD)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Read the presented token from the header, then the query string, then a form body.
/// A buffered form body is put back into the request.
async fn presented_token(request: Request) -> Result<(Request, Option<String>), Error> {
    let from_header = request
        .headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    if from_header.is_some() {
        return Ok((request, from_header));
    }
    if let Some(token) = query_token(&request) {
        return Ok((request, Some(token)));
    }
    if !is_form(request.headers()) {
        return Ok((request, None));
    }

    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, MAX_FORM_BODY).await.map_err(|e| Error::BadRequest {
        message: format!("Unable to read form body: {e}"),
    })?;
    let token = form_token(&bytes);
    Ok((Request::from_parts(parts, Body::from(bytes)), token))
}

fn attach_csrf(response: &mut Response, cookie: HeaderValue, token: &str) {
    response.headers_mut().append(header::SET_COOKIE, cookie);
    if let Ok(value) = HeaderValue::from_str(token) {
        response.headers_mut().insert(CSRF_HEADER, value);
    }
}

/// Enforce double-submit CSRF protection on unsafe requests that ride on a session cookie.
#[tracing::instrument(skip_all)]
pub async fn csrf_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let auth = &state.config.auth;
    if let Some(reason) = exemption(request.method(), request.headers(), &auth.api_token_header) {
        tracing::trace!(path = %request.uri().path(), reason, "CSRF check skipped");
        return next.run(request).await;
    }

    let Some(session_id) = read_cookie(request.headers(), &auth.session.cookie_name) else {
        tracing::debug!(path = %request.uri().path(), "CSRF check skipped: no session cookie");
        return next.run(request).await;
    };

    let shape = RequestShape::from_request(request.uri(), request.headers());
    let (parts, body) = request.into_parts();
    let settings = CookieSettings::for_client(&client_of(&parts, &state.proxies));
    let had_cookie = read_cookie(&parts.headers, &auth.session.csrf_cookie_name).is_some();
    let path = parts.uri.path().to_string();

    let (request, token) = match presented_token(Request::from_parts(parts, body)).await {
        Ok(found) => found,
        Err(e) => return e.render(&shape),
    };

    match token {
        Some(token) if state.csrf.validate(&session_id, &token) => {
            tracing::debug!(path = %path, session = %redacted(&session_id), "CSRF validation successful");
            let mut response = next.run(request).await;
            if !had_cookie {
                attach_csrf(&mut response, csrf_cookie(&auth.session.csrf_cookie_name, &token, settings), &token);
            }
            response
        }
        token => {
            tracing::warn!(
                path = %path,
                session = %redacted(&session_id),
                provided = %token.as_deref().map(redacted).unwrap_or_default(),
                "Missing or invalid CSRF token"
            );
            let fresh = state.csrf.generate(&session_id);
            let mut response = Error::CsrfRejected.render(&shape);
            attach_csrf(&mut response, csrf_cookie(&auth.session.csrf_cookie_name, &fresh, settings), &fresh);
            response
        }
    }
}
