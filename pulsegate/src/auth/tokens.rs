//! API token records and scope normalization.
//!
//! A token record never holds the raw token: only its SHA-256 digest plus a short prefix and
//! suffix for display. Scopes are either exactly `["*"]` or a sorted, deduplicated set of known
//! scope identifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use uuid::Uuid;

use crate::crypto;
use crate::errors::Error;

pub const SCOPE_WILDCARD: &str = "*";
pub const SCOPE_MONITORING_READ: &str = "monitoring:read";
pub const SCOPE_MONITORING_WRITE: &str = "monitoring:write";
pub const SCOPE_DOCKER_REPORT: &str = "docker:report";
pub const SCOPE_DOCKER_MANAGE: &str = "docker:manage";
pub const SCOPE_HOST_AGENT_REPORT: &str = "host-agent:report";
pub const SCOPE_HOST_AGENT_CONFIG_READ: &str = "host-agent:config:read";
pub const SCOPE_HOST_AGENT_MANAGE: &str = "host-agent:manage";
pub const SCOPE_KUBERNETES_REPORT: &str = "kubernetes:report";
pub const SCOPE_KUBERNETES_MANAGE: &str = "kubernetes:manage";
pub const SCOPE_SETTINGS_READ: &str = "settings:read";
pub const SCOPE_SETTINGS_WRITE: &str = "settings:write";
pub const SCOPE_AI_CHAT: &str = "ai:chat";
pub const SCOPE_AI_EXECUTE: &str = "ai:execute";
pub const SCOPE_AGENT_EXEC: &str = "agent:exec";

/// Every scope a token may be granted, wildcard included.
pub const KNOWN_SCOPES: &[&str] = &[
    SCOPE_WILDCARD,
    SCOPE_MONITORING_READ,
    SCOPE_MONITORING_WRITE,
    SCOPE_DOCKER_REPORT,
    SCOPE_DOCKER_MANAGE,
    SCOPE_HOST_AGENT_REPORT,
    SCOPE_HOST_AGENT_CONFIG_READ,
    SCOPE_HOST_AGENT_MANAGE,
    SCOPE_KUBERNETES_REPORT,
    SCOPE_KUBERNETES_MANAGE,
    SCOPE_SETTINGS_READ,
    SCOPE_SETTINGS_WRITE,
    SCOPE_AI_CHAT,
    SCOPE_AI_EXECUTE,
    SCOPE_AGENT_EXEC,
];

/// Scope that makes a token-authenticated caller an administrator
pub const ADMIN_SCOPE: &str = SCOPE_SETTINGS_WRITE;

const DISPLAY_PREFIX_LEN: usize = 6;
const DISPLAY_SUFFIX_LEN: usize = 4;

#[derive(ThisError, Debug, PartialEq, Eq)]
pub enum ScopeError {
    #[error("scopes must not be empty; omit the field for full access")]
    Empty,
    #[error("scope entries must not be blank")]
    Blank,
    #[error("wildcard scope cannot be combined with other scopes")]
    WildcardMixed,
    #[error("unknown scope: {0}")]
    Unknown(String),
}

impl From<ScopeError> for Error {
    fn from(e: ScopeError) -> Self {
        Error::BadRequest { message: e.to_string() }
    }
}

pub fn is_known_scope(scope: &str) -> bool {
    KNOWN_SCOPES.contains(&scope)
}

/// Validate and canonicalize a requested scope list.
///
/// `None` means full access. An explicit empty list, blank entries, unknown scopes and a
/// wildcard mixed with other scopes are rejected.
pub fn normalize_scopes(requested: Option<&[String]>) -> Result<Vec<String>, ScopeError> {
    let Some(requested) = requested else {
        return Ok(vec![SCOPE_WILDCARD.to_string()]);
    };
    if requested.is_empty() {
        return Err(ScopeError::Empty);
    }

    let mut scopes = Vec::with_capacity(requested.len());
    for raw in requested {
        let scope = raw.trim();
        if scope.is_empty() {
            return Err(ScopeError::Blank);
        }
        if !is_known_scope(scope) {
            return Err(ScopeError::Unknown(scope.to_string()));
        }
        scopes.push(scope.to_string());
    }

    scopes.sort();
    scopes.dedup();

    if scopes.len() > 1 && scopes.iter().any(|s| s == SCOPE_WILDCARD) {
        return Err(ScopeError::WildcardMixed);
    }
    Ok(scopes)
}

/// Persisted API token metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiTokenRecord {
    pub id: String,
    pub name: String,
    /// SHA-256 hex digest of the raw token
    pub hash: String,
    pub prefix: String,
    pub suffix: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Organizations the token is restricted to; empty means unrestricted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub org_ids: Vec<String>,
}

impl ApiTokenRecord {
    /// Build a record for a freshly generated raw token. Scopes must already be normalized.
    pub fn new(raw_token: &str, name: &str, scopes: Vec<String>) -> Result<Self, Error> {
        if raw_token.is_empty() {
            return Err(Error::BadRequest {
                message: "token must not be empty".to_string(),
            });
        }
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            hash: crypto::sha256_hex(raw_token),
            prefix: token_prefix(raw_token),
            suffix: token_suffix(raw_token),
            created_at: Utc::now(),
            last_used_at: None,
            expires_at: None,
            scopes,
            org_ids: Vec::new(),
        })
    }

    /// Whether the token grants `scope`. Records without scopes predate scoping and grant everything.
    pub fn has_scope(&self, scope: &str) -> bool {
        scopes_grant(&self.scopes, scope)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    /// Whether the token may act within `org_id`
    pub fn allows_org(&self, org_id: &str) -> bool {
        self.org_ids.is_empty() || self.org_ids.iter().any(|o| o == org_id)
    }

    /// Effective scope list for display, expanding legacy empty scopes to the wildcard
    pub fn effective_scopes(&self) -> Vec<String> {
        if self.scopes.is_empty() {
            vec![SCOPE_WILDCARD.to_string()]
        } else {
            self.scopes.clone()
        }
    }
}

/// Whether a scope list grants `scope`. An empty list predates scoping and grants everything.
pub fn scopes_grant(scopes: &[String], scope: &str) -> bool {
    if scope.is_empty() || scopes.is_empty() {
        return true;
    }
    scopes.iter().any(|s| s == SCOPE_WILDCARD || s == scope)
}

/// Generate a raw API token (32 random bytes, hex)
pub fn generate_token() -> String {
    crypto::random_hex(32)
}

fn token_prefix(value: &str) -> String {
    value.chars().take(DISPLAY_PREFIX_LEN).collect()
}

fn token_suffix(value: &str) -> String {
    let count = value.chars().count();
    value.chars().skip(count.saturating_sub(DISPLAY_SUFFIX_LEN)).collect()
}
