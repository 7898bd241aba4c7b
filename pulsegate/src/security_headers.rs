//! Browser hardening headers applied to every response.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, header},
    middleware::Next,
    response::Response,
};

use crate::AppState;
use crate::config::SecurityConfig;
use crate::net::client_ip::client_of;

pub const HSTS_VALUE: &str = "max-age=31536000; includeSubDomains";
const PERMISSIONS_POLICY: &str =
    "geolocation=(), microphone=(), camera=(), payment=(), usb=(), magnetometer=(), gyroscope=(), accelerometer=()";

/// Build the Content-Security-Policy for the embedding settings and transport.
pub fn content_security_policy(security: &SecurityConfig, secure: bool) -> String {
    let mut directives = vec![
        "default-src 'self'".to_string(),
        "script-src 'self' 'unsafe-inline' 'unsafe-eval'".to_string(),
        "style-src 'self' 'unsafe-inline'".to_string(),
        "img-src 'self' data: blob:".to_string(),
        "connect-src 'self' ws: wss:".to_string(),
        "font-src 'self' data:".to_string(),
    ];

    if security.allow_embedding {
        let mut ancestors = String::from("frame-ancestors 'self'");
        for origin in security.allowed_embed_origins.iter().map(|o| o.trim()).filter(|o| !o.is_empty()) {
            ancestors.push(' ');
            ancestors.push_str(origin);
        }
        directives.push(ancestors);
    } else {
        directives.push("frame-ancestors 'none'".to_string());
    }

    if secure {
        directives.push("upgrade-insecure-requests".to_string());
    }
    directives.join("; ")
}

/// Insert the hardening headers into `headers`.
pub fn apply_security_headers(headers: &mut HeaderMap, security: &SecurityConfig, secure: bool) {
    if !security.allow_embedding {
        headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    }
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_XSS_PROTECTION, HeaderValue::from_static("0"));
    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("strict-origin-when-cross-origin"));
    headers.insert("permissions-policy", HeaderValue::from_static(PERMISSIONS_POLICY));

    match HeaderValue::from_str(&content_security_policy(security, secure)) {
        Ok(csp) => {
            headers.insert(header::CONTENT_SECURITY_POLICY, csp);
        }
        Err(e) => tracing::error!(error = %e, "Embed origins produced an invalid Content-Security-Policy"),
    }

    if secure {
        headers.insert(header::STRICT_TRANSPORT_SECURITY, HeaderValue::from_static(HSTS_VALUE));
    }
}

/// Middleware adding security headers. HSTS only for confirmed HTTPS.
pub async fn security_headers(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();
    let secure = client_of(&parts, &state.proxies).secure;
    let mut response = next.run(Request::from_parts(parts, body)).await;
    apply_security_headers(response.headers_mut(), &state.config.security, secure);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_config, create_test_state, test_server, test_server_with_peer};

    #[test]
    fn test_csp_frame_ancestors() {
        let mut security = SecurityConfig::default();
        let csp = content_security_policy(&security, false);
        assert!(csp.contains("frame-ancestors 'none'"));
        assert!(!csp.contains("upgrade-insecure-requests"));

        security.allow_embedding = true;
        security.allowed_embed_origins = vec!["https://portal.example.com".to_string(), " ".to_string()];
        let csp = content_security_policy(&security, true);
        assert!(csp.contains("frame-ancestors 'self' https://portal.example.com;"));
        assert!(csp.ends_with("upgrade-insecure-requests"));
    }

    #[tokio::test]
    async fn test_headers_on_plain_http() {
        let server = test_server(create_test_state(create_test_config()));
        let response = server.get("/api/health").add_header("x-forwarded-proto", "https").await;

        assert_eq!(response.header("x-frame-options"), "DENY");
        assert_eq!(response.header("x-content-type-options"), "nosniff");
        assert_eq!(response.header("x-xss-protection"), "0");
        // Forwarded proto from an untrusted peer is ignored
        assert!(response.headers().get("strict-transport-security").is_none());
    }

    #[tokio::test]
    async fn test_hsts_behind_trusted_proxy() {
        let mut config = create_test_config();
        config.trusted_proxy_cidrs = vec!["10.0.0.0/8".to_string()];
        let server = test_server_with_peer(create_test_state(config), "10.1.2.3:40000".parse().unwrap());

        let response = server.get("/api/health").add_header("x-forwarded-proto", "https").await;
        assert_eq!(response.header("strict-transport-security"), HSTS_VALUE);

        let plain = server.get("/api/health").await;
        assert!(plain.headers().get("strict-transport-security").is_none());
    }
}
