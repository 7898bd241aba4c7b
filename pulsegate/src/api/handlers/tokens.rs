use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{TimeDelta, Utc};
use std::time::Duration;

use crate::{
    AppState,
    api::models::tokens::{TokenCreate, TokenCreated, TokenResponse},
    auth::{
        identity::Identity,
        tokens::{ApiTokenRecord, generate_token, normalize_scopes},
    },
    errors::{Error, Result},
};

const DEFAULT_TOKEN_NAME: &str = "API token";
const MIN_TOKEN_LIFETIME: Duration = Duration::from_secs(60);

/// A token may only hand out scopes it holds itself
fn ensure_grantable(caller: &Identity, scopes: &[String]) -> Result<()> {
    if !caller.is_token() {
        return Ok(());
    }
    if let Some(missing) = scopes.iter().find(|scope| !caller.has_scope(scope)) {
        tracing::warn!(caller = %caller.username, scope = %missing, "Token attempted to grant a scope it does not hold");
        return Err(Error::Forbidden {
            message: format!("Cannot grant scope {missing}: the requesting token does not hold it"),
        });
    }
    Ok(())
}

/// Organizations the calling token is bound to. `None` for unbound tokens and non-token callers,
/// which may bind new tokens to any organization.
fn caller_orgs(state: &AppState, caller: &Identity) -> Result<Option<Vec<String>>> {
    let Some(token_id) = caller.token_id.as_deref().filter(|_| caller.is_token()) else {
        return Ok(None);
    };
    let record = state.tokens.get(token_id).ok_or_else(|| Error::Unauthenticated {
        message: Some("Requesting token no longer exists".to_string()),
    })?;
    Ok((!record.org_ids.is_empty()).then_some(record.org_ids))
}

/// An org-bound token may only issue tokens bound within its own organizations. With no
/// organizations requested, the new token is bound to the one the caller is acting in.
fn bind_orgs(caller: &Identity, allowed: Option<&[String]>, requested: Vec<String>) -> Result<Vec<String>> {
    let Some(allowed) = allowed else {
        return Ok(requested);
    };
    if requested.is_empty() {
        let active = caller.org_id.clone().ok_or_else(|| Error::AccessDenied {
            org_id: String::new(),
        })?;
        return Ok(vec![active]);
    }
    if let Some(outside) = requested.iter().find(|org| !allowed.contains(org)) {
        tracing::warn!(caller = %caller.username, org_id = %outside, "Token attempted to bind outside its organizations");
        return Err(Error::AccessDenied { org_id: outside.clone() });
    }
    Ok(requested)
}

/// An org-bound token may only rotate tokens confined to its own organizations
fn ensure_org_contained(caller: &Identity, allowed: Option<&[String]>, target: &ApiTokenRecord) -> Result<()> {
    let Some(allowed) = allowed else {
        return Ok(());
    };
    if target.org_ids.is_empty() {
        tracing::warn!(caller = %caller.username, token_id = %target.id, "Org-bound token attempted to rotate an unbound token");
        return Err(Error::AccessDenied {
            org_id: caller.org_id.clone().unwrap_or_default(),
        });
    }
    match target.org_ids.iter().find(|org| !allowed.contains(org)) {
        Some(outside) => Err(Error::AccessDenied { org_id: outside.clone() }),
        None => Ok(()),
    }
}

/// Token store mutations write to disk; keep them off the async workers
async fn run_blocking<T, F>(operation: &'static str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| Error::Internal {
        operation: format!("spawn {operation} task: {e}"),
    })?
}

fn normalize_org_ids(org_ids: Option<Vec<String>>) -> Vec<String> {
    let mut org_ids: Vec<String> = org_ids
        .unwrap_or_default()
        .into_iter()
        .map(|o| o.trim().to_string())
        .filter(|o| !o.is_empty())
        .collect();
    org_ids.sort();
    org_ids.dedup();
    org_ids
}

/// List API tokens (metadata only)
#[utoipa::path(
    get,
    path = "/api/security/tokens",
    tag = "tokens",
    responses(
        (status = 200, description = "API tokens, newest first", body = [TokenResponse]),
        (status = 401, description = "Not authenticated"),
        (status = 403, description = "Admin privileges required"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_tokens(State(state): State<AppState>) -> Json<Vec<TokenResponse>> {
    Json(state.tokens.list().into_iter().map(TokenResponse::from).collect())
}

/// Issue a new API token. The raw token is returned only in this response.
#[utoipa::path(
    post,
    path = "/api/security/tokens",
    request_body = TokenCreate,
    tag = "tokens",
    responses(
        (status = 201, description = "Token created", body = TokenCreated),
        (status = 400, description = "Invalid scopes or lifetime"),
        (status = 403, description = "Admin privileges required, scope escalation, or organization outside the caller's binding"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn create_token(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<TokenCreate>,
) -> Result<(StatusCode, Json<TokenCreated>)> {
    let scopes = normalize_scopes(request.scopes.as_deref())?;
    ensure_grantable(&identity, &scopes)?;
    let allowed_orgs = caller_orgs(&state, &identity)?;
    let org_ids = bind_orgs(&identity, allowed_orgs.as_deref(), normalize_org_ids(request.org_ids))?;

    let expires_at = match request.expires_in {
        Some(lifetime) if lifetime < MIN_TOKEN_LIFETIME => {
            return Err(Error::BadRequest {
                message: "expires_in must be at least 1 minute".to_string(),
            });
        }
        Some(lifetime) => {
            let delta = TimeDelta::from_std(lifetime).map_err(|_| Error::BadRequest {
                message: "expires_in is too large".to_string(),
            })?;
            Some(Utc::now().checked_add_signed(delta).ok_or_else(|| Error::BadRequest {
                message: "expires_in is too large".to_string(),
            })?)
        }
        None => None,
    };

    let name = request
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(DEFAULT_TOKEN_NAME);

    let raw = generate_token();
    let mut record = ApiTokenRecord::new(&raw, name, scopes)?;
    record.expires_at = expires_at;
    record.org_ids = org_ids;

    let tokens = state.tokens.clone();
    let record = run_blocking("token insert", move || tokens.insert(record)).await?;
    tracing::info!(
        token_id = %record.id,
        prefix = %record.prefix,
        scopes = ?record.scopes,
        created_by = %identity.username,
        "API token created"
    );

    Ok((
        StatusCode::CREATED,
        Json(TokenCreated {
            token: raw,
            record: record.into(),
        }),
    ))
}

/// Revoke an API token
#[utoipa::path(
    delete,
    path = "/api/security/tokens/{id}",
    tag = "tokens",
    params(("id" = String, Path, description = "Token ID")),
    responses(
        (status = 204, description = "Token deleted"),
        (status = 404, description = "Token not found"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn delete_token(State(state): State<AppState>, identity: Identity, Path(id): Path<String>) -> Result<StatusCode> {
    let tokens = state.tokens.clone();
    let target = id.clone();
    match run_blocking("token delete", move || tokens.delete(&target)).await? {
        Some(record) => {
            tracing::info!(token_id = %record.id, deleted_by = %identity.username, "API token deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(Error::NotFound {
            resource: "API token".to_string(),
            id,
        }),
    }
}

/// Replace a token's secret, keeping its name, scopes, organizations and expiry
#[utoipa::path(
    post,
    path = "/api/security/tokens/{id}/rotate",
    tag = "tokens",
    params(("id" = String, Path, description = "Token ID")),
    responses(
        (status = 200, description = "Token rotated; the old secret no longer validates", body = TokenCreated),
        (status = 403, description = "Admin privileges required, scope escalation, or organization outside the caller's binding"),
        (status = 404, description = "Token not found"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn rotate_token(State(state): State<AppState>, identity: Identity, Path(id): Path<String>) -> Result<Json<TokenCreated>> {
    let not_found = || Error::NotFound {
        resource: "API token".to_string(),
        id: id.clone(),
    };
    let existing = state.tokens.get(&id).ok_or_else(not_found)?;
    ensure_grantable(&identity, &existing.effective_scopes())?;
    let allowed_orgs = caller_orgs(&state, &identity)?;
    ensure_org_contained(&identity, allowed_orgs.as_deref(), &existing)?;

    let raw = generate_token();
    let tokens = state.tokens.clone();
    let (target, secret) = (id.clone(), raw.clone());
    let (old, rotated) = run_blocking("token rotate", move || tokens.rotate(&target, &secret))
        .await?
        .ok_or_else(not_found)?;
    tracing::info!(old_id = %old.id, new_id = %rotated.id, rotated_by = %identity.username, "API token rotated");

    Ok(Json(TokenCreated {
        token: raw,
        record: rotated.into(),
    }))
}
