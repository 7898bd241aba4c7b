//! OpenAPI documentation for the gateway's own endpoints, served at `/api/openapi.json`.

use utoipa::{
    Modify, OpenApi,
    openapi::security::{ApiKey, ApiKeyValue, HttpAuthScheme, HttpBuilder, SecurityScheme},
};

use crate::api::{
    handlers,
    models::{
        auth::{LoginFailure, LoginSuccess, LogoutSuccess},
        security::{
            BootstrapTokenRequest, BootstrapTokenValidation, HealthResponse, LockoutStatus, RecoveryTokenResponse, ResetLockoutRequest,
            SecurityStatus,
        },
        tokens::{TokenCreate, TokenCreated, TokenResponse},
    },
};
use crate::auth::identity::{AuthMethod, Identity};
use crate::errors::ErrorEnvelope;

/// Credential schemes accepted by the gateway
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let Some(components) = openapi.components.as_mut() else {
            return;
        };
        components.add_security_scheme(
            "ApiToken",
            SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                "X-API-Token",
                "API token. `Authorization: Bearer <token>` is accepted as well.",
            ))),
        );
        components.add_security_scheme(
            "BasicAuth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Basic).build()),
        );
        components.add_security_scheme(
            "SessionCookie",
            SecurityScheme::ApiKey(ApiKey::Cookie(ApiKeyValue::with_description(
                "pulse_session",
                "Session cookie issued by `/api/login`. Unsafe methods also require the `X-CSRF-Token` header.",
            ))),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Pulse security gateway",
        description = "Authentication, session, API token and lockout administration endpoints.",
    ),
    paths(
        handlers::health::health,
        handlers::auth::login,
        handlers::auth::logout,
        handlers::auth::me,
        handlers::tokens::list_tokens,
        handlers::tokens::create_token,
        handlers::tokens::delete_token,
        handlers::tokens::rotate_token,
        handlers::security::get_lockout,
        handlers::security::reset_lockout,
        handlers::security::create_recovery_token,
        handlers::security::validate_bootstrap_token,
        handlers::security::security_status,
    ),
    components(schemas(
        ErrorEnvelope,
        Identity,
        AuthMethod,
        LoginSuccess,
        LoginFailure,
        LogoutSuccess,
        TokenCreate,
        TokenResponse,
        TokenCreated,
        LockoutStatus,
        ResetLockoutRequest,
        RecoveryTokenResponse,
        BootstrapTokenRequest,
        BootstrapTokenValidation,
        SecurityStatus,
        HealthResponse,
    )),
    modifiers(&SecurityAddon),
    security(("ApiToken" = []), ("BasicAuth" = []), ("SessionCookie" = [])),
    tags(
        (name = "authentication", description = "Login, logout and identity"),
        (name = "tokens", description = "API token administration"),
        (name = "security", description = "Lockout, recovery and bootstrap"),
        (name = "system", description = "Health"),
    )
)]
pub struct ApiDoc;
