//! Login, logout and identity models.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::csrf::CSRF_HEADER;
use crate::auth::identity::AuthMethod;

/// Body returned by a successful login
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LoginSuccess {
    pub username: String,
    pub method: AuthMethod,
    pub is_admin: bool,
    pub expires_at: DateTime<Utc>,
}

/// Successful login: body plus the session and CSRF cookies
#[derive(Debug)]
pub struct LoginResponse {
    pub body: LoginSuccess,
    pub session_cookie: HeaderValue,
    pub csrf_cookie: HeaderValue,
    pub csrf_token: HeaderValue,
}

impl IntoResponse for LoginResponse {
    fn into_response(self) -> Response {
        let mut response = (StatusCode::OK, Json(self.body)).into_response();
        let headers = response.headers_mut();
        headers.append(header::SET_COOKIE, self.session_cookie);
        headers.append(header::SET_COOKIE, self.csrf_cookie);
        headers.insert(CSRF_HEADER, self.csrf_token);
        response
    }
}

/// Body returned for rejected credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LoginFailure {
    pub error: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl IntoResponse for LoginFailure {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, Json(self)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogoutSuccess {
    pub message: String,
}

/// Logout body plus cookie clearing headers
#[derive(Debug)]
pub struct LogoutResponse {
    pub body: LogoutSuccess,
    pub cleared: Vec<HeaderValue>,
}

impl IntoResponse for LogoutResponse {
    fn into_response(self) -> Response {
        let mut response = (StatusCode::OK, Json(self.body)).into_response();
        for cookie in self.cleared {
            response.headers_mut().append(header::SET_COOKIE, cookie);
        }
        response
    }
}
