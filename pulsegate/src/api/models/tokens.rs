//! API token administration models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use utoipa::ToSchema;

use crate::auth::tokens::ApiTokenRecord;

// API token request models.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct TokenCreate {
    /// Display name, defaults to "API token"
    pub name: Option<String>,
    /// Scopes to grant; omitted means the wildcard scope
    pub scopes: Option<Vec<String>>,
    /// Lifetime as a human readable duration such as `30d` or `12h` (at least one minute)
    #[serde(default, with = "humantime_serde")]
    #[schema(value_type = Option<String>, example = "30d")]
    pub expires_in: Option<Duration>,
    /// Organizations the token is restricted to; omitted means unrestricted
    pub org_ids: Option<Vec<String>>,
}

// API token response models. Hashes never leave the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    pub id: String,
    pub name: String,
    /// Leading characters of the raw token, for recognition
    pub prefix: String,
    /// Trailing characters of the raw token, for recognition
    pub suffix: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub org_ids: Vec<String>,
}

impl From<ApiTokenRecord> for TokenResponse {
    fn from(record: ApiTokenRecord) -> Self {
        Self {
            scopes: record.effective_scopes(),
            id: record.id,
            name: record.name,
            prefix: record.prefix,
            suffix: record.suffix,
            created_at: record.created_at,
            last_used_at: record.last_used_at,
            expires_at: record.expires_at,
            org_ids: record.org_ids,
        }
    }
}

/// A newly issued raw token. This is the only time the raw value is returned.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenCreated {
    pub token: String,
    pub record: TokenResponse,
}
