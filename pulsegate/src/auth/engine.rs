//! Authentication decision engine.
//!
//! The engine answers one question per request: who is calling, and through which mechanism?
//! The order of precedence is fixed:
//!
//! 1. Development admin bypass, when explicitly enabled
//! 2. Open mode (nothing configured): anonymous admin, or bootstrap via `X-Setup-Token`
//! 3. Recovery token
//! 4. Proxy authentication
//! 5. API token (header, bearer, or WebSocket query parameter)
//! 6. HTTP Basic
//! 7. Session cookie
//!
//! The first mechanism to accept a credential wins. Rejected credentials fall through to the
//! next mechanism, except organization denials and lockouts, which end evaluation immediately.

use axum::http::request::Parts;

use super::evaluators::{
    ApiTokenEvaluator, BasicEvaluator, BootstrapEvaluator, CredentialEvaluator, ProxyEvaluator, RecoveryEvaluator, SessionEvaluator,
};
use super::identity::{AuthMethod, Identity};
use crate::AppState;
use crate::errors::Error;
use crate::net::client_ip::{ClientIp, client_of};

pub struct AuthEngine {
    evaluators: Vec<Box<dyn CredentialEvaluator>>,
}

impl Default for AuthEngine {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for AuthEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthEngine")
            .field("evaluators", &self.evaluators.iter().map(|e| e.name()).collect::<Vec<_>>())
            .finish()
    }
}

/// True when no authentication mechanism is configured and no API token exists.
pub fn is_open_mode(state: &AppState) -> bool {
    let auth = &state.config.auth;
    !auth.password_enabled() && !auth.proxy_enabled() && !auth.oidc_enabled && !auth.saml_enabled && state.tokens.is_empty()
}

fn is_terminal(error: &Error) -> bool {
    matches!(
        error,
        Error::AccessDenied { .. } | Error::Locked { .. } | Error::Internal { .. } | Error::Other(_)
    )
}

impl AuthEngine {
    pub fn standard() -> Self {
        Self::with_evaluators(vec![
            Box::new(RecoveryEvaluator),
            Box::new(ProxyEvaluator),
            Box::new(ApiTokenEvaluator),
            Box::new(BasicEvaluator),
            Box::new(SessionEvaluator),
        ])
    }

    pub fn with_evaluators(evaluators: Vec<Box<dyn CredentialEvaluator>>) -> Self {
        Self { evaluators }
    }

    pub fn evaluator_names(&self) -> Vec<&'static str> {
        self.evaluators.iter().map(|e| e.name()).collect()
    }

    /// Decide the caller's identity for a request.
    pub fn authenticate(&self, parts: &Parts, state: &AppState) -> Result<Identity, Error> {
        if state.admin_bypass {
            return Ok(Identity::new("admin", AuthMethod::Bypass, true));
        }

        let client = client_of(parts, &state.proxies);

        if is_open_mode(state) {
            return Ok(self.open_mode_identity(parts, state, &client));
        }

        // A rejected credential only counts against the IP if no later mechanism succeeds
        let mut first_rejection = None;
        let mut count_against_ip = false;
        for evaluator in &self.evaluators {
            match evaluator.evaluate(parts, state, &client) {
                None => continue,
                Some(Ok(identity)) => {
                    tracing::debug!(
                        user = %identity.username,
                        method = identity.method.as_str(),
                        client_ip = %client.ip,
                        "Request authenticated"
                    );
                    return Ok(identity);
                }
                Some(Err(error)) if is_terminal(&error) => {
                    tracing::warn!(mechanism = evaluator.name(), client_ip = %client.ip, code = error.code(), "Authentication stopped");
                    return Err(error);
                }
                Some(Err(error)) => {
                    tracing::debug!(mechanism = evaluator.name(), client_ip = %client.ip, "Credential rejected");
                    count_against_ip |= evaluator.records_ip_failures();
                    first_rejection.get_or_insert(error);
                }
            }
        }

        if count_against_ip {
            let info = state.lockout.record_failure(&client.ip.to_string());
            tracing::debug!(client_ip = %client.ip, attempts = info.attempts, locked = info.locked, "Authentication failure recorded");
        }
        Err(first_rejection.unwrap_or(Error::Unauthenticated { message: None }))
    }

    fn open_mode_identity(&self, parts: &Parts, state: &AppState, client: &ClientIp) -> Identity {
        match BootstrapEvaluator.evaluate(parts, state, client) {
            Some(Ok(identity)) => identity,
            Some(Err(error)) => {
                // Open mode admits every request; a bad setup token only loses the bootstrap label
                tracing::warn!(client_ip = %client.ip, code = error.code(), "Setup token rejected in open mode");
                Identity::anonymous()
            }
            None => Identity::anonymous(),
        }
    }
}
