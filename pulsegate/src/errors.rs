use axum::{
    Json,
    http::{HeaderMap, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error as ThisError;
use utoipa::ToSchema;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Authentication required but not provided, or the credential was rejected
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// Too many recent failures for this identifier
    #[error("Account locked until {locked_until}")]
    Locked { locked_until: DateTime<Utc> },

    /// Authenticated but lacking the role required for the operation
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    /// Authenticated credential is not bound to the requested organization
    #[error("Access denied to organization {org_id}")]
    AccessDenied { org_id: String },

    /// API token does not carry the scope required for the operation
    #[error("Missing required scope {scope}")]
    MissingScope { scope: String },

    /// Unsafe request with a session cookie but no valid CSRF token
    #[error("CSRF token missing or invalid")]
    CsrfRejected,

    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } | Error::Locked { .. } => StatusCode::UNAUTHORIZED,
            Error::Forbidden { .. } | Error::AccessDenied { .. } | Error::MissingScope { .. } | Error::CsrfRejected => {
                StatusCode::FORBIDDEN
            }
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Internal { .. } | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code carried in the JSON envelope
    pub fn code(&self) -> &'static str {
        match self {
            Error::Unauthenticated { .. } => "authentication_required",
            Error::Locked { .. } => "account_locked",
            Error::Forbidden { .. } => "forbidden",
            Error::AccessDenied { .. } => "access_denied",
            Error::MissingScope { .. } => "missing_scope",
            Error::CsrfRejected => "csrf_invalid",
            Error::BadRequest { .. } => "bad_request",
            Error::NotFound { .. } => "not_found",
            Error::Internal { .. } | Error::Other(_) => "internal_error",
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::Locked { locked_until } => {
                format!("Too many failed attempts. Try again after {}", locked_until.to_rfc3339())
            }
            Error::Forbidden { message } => message.clone(),
            Error::AccessDenied { org_id } => format!("Access denied to organization {org_id}"),
            Error::MissingScope { scope } => format!("Token is missing required scope {scope}"),
            Error::CsrfRejected => "CSRF token missing or invalid".to_string(),
            Error::BadRequest { message } => message.clone(),
            Error::NotFound { resource, id } => {
                format!("{resource} with ID {id} not found")
            }
            Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
        }
    }

    /// Render for a specific request: JSON envelope for API paths and JSON-accepting clients,
    /// plain text otherwise.
    pub fn render(self, shape: &RequestShape) -> Response {
        self.log();
        if shape.wants_json {
            self.json_response(shape.request_id.clone())
        } else {
            (self.status_code(), self.user_message()).into_response()
        }
    }

    fn log(&self) {
        // Different log levels based on severity
        match self {
            Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Unauthenticated { .. }
            | Error::Locked { .. }
            | Error::Forbidden { .. }
            | Error::AccessDenied { .. }
            | Error::MissingScope { .. }
            | Error::CsrfRejected => {
                tracing::info!("Authorization error: {}", self);
            }
            Error::BadRequest { .. } | Error::NotFound { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }
    }

    fn json_response(&self, request_id: Option<String>) -> Response {
        let status = self.status_code();
        let body = ErrorEnvelope {
            error: self.user_message(),
            code: self.code().to_string(),
            status_code: status.as_u16(),
            timestamp: Utc::now(),
            request_id,
        };
        let mut response = (status, Json(body)).into_response();
        if let Error::Locked { locked_until } = self
            && let Ok(value) = locked_until.to_rfc3339().parse()
        {
            response.headers_mut().insert("x-locked-until", value);
        }
        response
    }
}

/// JSON error body returned by every API endpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorEnvelope {
    pub error: String,
    pub code: String,
    pub status_code: u16,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// The parts of a request that decide how an error is rendered.
#[derive(Debug, Clone, Default)]
pub struct RequestShape {
    pub wants_json: bool,
    pub request_id: Option<String>,
}

impl RequestShape {
    pub fn from_request(uri: &Uri, headers: &HeaderMap) -> Self {
        let accepts_json = headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("application/json"));
        Self {
            wants_json: uri.path().starts_with("/api/") || accepts_json,
            request_id: headers.get("x-request-id").and_then(|v| v.to_str().ok()).map(str::to_string),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        self.log();
        self.json_response(None)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
