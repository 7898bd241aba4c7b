//! Route gates built on the [`AuthEngine`](super::engine::AuthEngine).
//!
//! [`require_auth`] admits any authenticated caller, [`require_admin`] additionally requires
//! administrator privileges, and [`require_scope`] checks API token scopes. Rejections are
//! rendered as a JSON envelope or plain text depending on the request.

use axum::{
    extract::{Request, State},
    http::{HeaderValue, request::Parts},
    middleware::Next,
    response::Response,
};
use tracing::{debug, warn};

use super::identity::Identity;
use crate::AppState;
use crate::errors::{Error, RequestShape};

pub const AUTHENTICATED_USER_HEADER: &str = "x-authenticated-user";
pub const AUTH_METHOD_HEADER: &str = "x-auth-method";

/// Which gate a route sits behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Authenticated,
    Admin,
}

/// Authenticate `parts` and apply `gate`. On success the identity is stored in request extensions.
pub(crate) fn authorize(state: &AppState, parts: &mut Parts, gate: Gate) -> Result<Identity, Error> {
    let identity = state.engine.authenticate(parts, state).inspect_err(|e| {
        warn!(path = %parts.uri.path(), code = e.code(), "Authentication required");
    })?;

    if gate == Gate::Admin && !identity.is_admin {
        warn!(user = %identity.username, method = identity.method.as_str(), path = %parts.uri.path(), "Non-admin user attempted admin route");
        return Err(Error::Forbidden {
            message: "Admin privileges required".to_string(),
        });
    }

    parts.extensions.insert(identity.clone());
    Ok(identity)
}

async fn gated(state: AppState, request: Request, next: Next, gate: Gate) -> Response {
    let (mut parts, body) = request.into_parts();
    let shape = RequestShape::from_request(&parts.uri, &parts.headers);

    let identity = match authorize(&state, &mut parts, gate) {
        Ok(identity) => identity,
        Err(e) => return e.render(&shape),
    };
    debug!(user = %identity.username, method = identity.method.as_str(), "Gate passed");

    let mut response = next.run(Request::from_parts(parts, body)).await;
    if let Ok(user) = HeaderValue::from_str(&identity.username) {
        response.headers_mut().insert(AUTHENTICATED_USER_HEADER, user);
    }
    response
        .headers_mut()
        .insert(AUTH_METHOD_HEADER, HeaderValue::from_static(identity.method.as_str()));
    response
}

/// Require any authenticated identity.
pub async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    gated(state, request, next, Gate::Authenticated).await
}

/// Require an identity with administrator privileges.
pub async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    gated(state, request, next, Gate::Admin).await
}

/// Require `scope` from API token callers. Must run inside [`require_auth`] or [`require_admin`].
///
/// ```ignore
/// router.route_layer(axum::middleware::from_fn(|req: Request, next: Next| require_scope(SCOPE_SETTINGS_READ, req, next)))
/// ```
pub async fn require_scope(scope: &'static str, request: Request, next: Next) -> Response {
    let shape = RequestShape::from_request(request.uri(), request.headers());
    match request.extensions().get::<Identity>() {
        Some(identity) if identity.has_scope(scope) => next.run(request).await,
        Some(identity) => {
            warn!(user = %identity.username, scope, path = %request.uri().path(), "Token missing required scope");
            Error::MissingScope { scope: scope.to_string() }.render(&shape)
        }
        None => Error::Unauthenticated { message: None }.render(&shape),
    }
}

/// Handler-level scope check for routes that decide on the scope at runtime.
pub fn ensure_scope(identity: &Identity, scope: &str) -> Result<(), Error> {
    if identity.has_scope(scope) {
        Ok(())
    } else {
        Err(Error::MissingScope { scope: scope.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tokens::{ApiTokenRecord, SCOPE_MONITORING_READ, SCOPE_SETTINGS_READ, SCOPE_SETTINGS_WRITE};
    use crate::test_utils::{basic_header, create_test_config, create_test_state, fast_hash};
    use axum::{Router, http::StatusCode, middleware::from_fn, middleware::from_fn_with_state, routing::get};
    use axum_test::TestServer;

    async fn whoami(identity: Identity) -> String {
        identity.username
    }

    fn server(state: AppState) -> TestServer {
        let authed = Router::new()
            .route("/api/whoami", get(whoami))
            .route_layer(from_fn_with_state(state.clone(), require_auth));
        let admin = Router::new()
            .route("/api/admin", get(whoami))
            .route_layer(from_fn_with_state(state.clone(), require_admin));
        let scoped = Router::new()
            .route("/api/settings", get(whoami))
            .route_layer(from_fn(|req: Request, next: Next| require_scope(SCOPE_SETTINGS_READ, req, next)))
            .route_layer(from_fn_with_state(state.clone(), require_auth));
        TestServer::new(authed.merge(admin).merge(scoped).with_state(state)).unwrap()
    }

    fn secured_state() -> AppState {
        let mut config = create_test_config();
        config.auth.username = Some("admin".to_string());
        config.auth.password_hash = Some(fast_hash("s3cret"));
        let state = create_test_state(config);
        state
            .tokens
            .insert(ApiTokenRecord::new("reader", "reader", vec![SCOPE_MONITORING_READ.to_string()]).unwrap())
            .unwrap();
        state
            .tokens
            .insert(ApiTokenRecord::new("writer", "writer", vec![SCOPE_SETTINGS_WRITE.to_string()]).unwrap())
            .unwrap();
        state
    }

    #[tokio::test]
    async fn test_unauthenticated_api_gets_json_envelope() {
        let server = server(secured_state());
        let response = server.get("/api/whoami").await;
        response.assert_status(StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = response.json();
        assert_eq!(body["code"], "authentication_required");
        assert_eq!(body["status_code"], 401);
    }

    #[tokio::test]
    async fn test_authenticated_headers_exposed() {
        let server = server(secured_state());
        let response = server
            .get("/api/whoami")
            .add_header("authorization", basic_header("admin", "s3cret"))
            .await;
        response.assert_status_ok();
        response.assert_text("admin");
        assert_eq!(response.header("x-authenticated-user"), "admin");
        assert_eq!(response.header("x-auth-method"), "basic");
    }

    #[tokio::test]
    async fn test_admin_gate() {
        let server = server(secured_state());

        let reader = server.get("/api/admin").add_header("x-api-token", "reader").await;
        reader.assert_status(StatusCode::FORBIDDEN);

        let writer = server.get("/api/admin").add_header("x-api-token", "writer").await;
        writer.assert_status_ok();
    }

    #[tokio::test]
    async fn test_scope_gate() {
        let server = server(secured_state());

        let reader = server.get("/api/settings").add_header("x-api-token", "reader").await;
        reader.assert_status(StatusCode::FORBIDDEN);
        let body: serde_json::Value = reader.json();
        assert_eq!(body["code"], "missing_scope");

        // settings:write does not imply settings:read
        let writer = server.get("/api/settings").add_header("x-api-token", "writer").await;
        writer.assert_status(StatusCode::FORBIDDEN);

        // Password callers are not scope-limited
        let basic = server
            .get("/api/settings")
            .add_header("authorization", basic_header("admin", "s3cret"))
            .await;
        basic.assert_status_ok();
    }

    #[test]
    fn test_ensure_scope() {
        let mut identity = Identity::new("token:1", crate::auth::identity::AuthMethod::ApiToken, false);
        identity.token_id = Some("1".to_string());
        identity.scopes = vec![SCOPE_MONITORING_READ.to_string()];
        assert!(ensure_scope(&identity, SCOPE_MONITORING_READ).is_ok());
        assert!(matches!(
            ensure_scope(&identity, SCOPE_SETTINGS_WRITE),
            Err(Error::MissingScope { .. })
        ));
    }
}
