//! In-memory session store and session-to-user index.
//!
//! Sessions are minted by the login endpoint here or by the SSO flows elsewhere; this store only
//! resolves a session cookie to a username and admin flag. When both maps are needed the session
//! map is always locked before the user index.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use crate::config::SessionConfig;
use crate::crypto;
use crate::redact::redacted;

/// How the session was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    Password,
    Oidc,
    Saml,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub username: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
    pub source: SessionSource,
}

/// Attributes of a session being created
#[derive(Debug, Clone)]
pub struct NewSession {
    pub username: String,
    pub is_admin: bool,
    pub source: SessionSource,
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
}

#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    user_index: RwLock<HashMap<String, Vec<String>>>,
    timeout: Duration,
    max_per_user: usize,
}

impl SessionStore {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            user_index: RwLock::new(HashMap::new()),
            timeout: config.timeout,
            max_per_user: config.max_sessions_per_user.max(1),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.timeout)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Create a session and index it under its user. Returns the session ID.
    pub fn create_session(&self, new: NewSession) -> String {
        let id = crypto::random_hex(32);
        let now = Utc::now();
        let record = SessionRecord {
            username: new.username.clone(),
            is_admin: new.is_admin,
            created_at: now,
            expires_at: self.expiry_from(now),
            user_agent: new.user_agent,
            client_ip: new.client_ip,
            source: new.source,
        };
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), record);
        self.track_user_session(&new.username, &id);
        tracing::debug!(user = %new.username, session = %redacted(&id), "Created session");
        id
    }

    /// Live session for `id`
    pub fn validate_session(&self, id: &str) -> Option<SessionRecord> {
        let now = Utc::now();
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .filter(|s| now < s.expires_at)
            .cloned()
    }

    /// Live session for `id`, with its expiry pushed out by the session timeout
    pub fn validate_and_extend(&self, id: &str) -> Option<SessionRecord> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let session = sessions.get_mut(id).filter(|s| now < s.expires_at)?;
        session.expires_at = self.expiry_from(now);
        Some(session.clone())
    }

    pub fn username_for(&self, id: &str) -> Option<String> {
        self.validate_session(id).map(|s| s.username)
    }

    pub fn delete_session(&self, id: &str) -> Option<SessionRecord> {
        let removed = self.sessions.write().unwrap_or_else(PoisonError::into_inner).remove(id)?;
        self.untrack_user_session(&removed.username, id);
        Some(removed)
    }

    /// Index `id` under `user`, evicting the oldest sessions beyond the per-user limit.
    /// IDs of sessions that no longer exist are pruned before counting.
    pub fn track_user_session(&self, user: &str, id: &str) {
        let evicted: Vec<String> = {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            let mut index = self.user_index.write().unwrap_or_else(PoisonError::into_inner);
            let ids = index.entry(user.to_string()).or_default();
            ids.retain(|existing| existing != id && sessions.contains_key(existing));
            ids.push(id.to_string());

            let excess = ids.len().saturating_sub(self.max_per_user);
            ids.drain(..excess).collect()
        };

        if !evicted.is_empty() {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            for old in &evicted {
                sessions.remove(old);
            }
            tracing::info!(user = user, evicted = evicted.len(), "Evicted oldest sessions beyond per-user limit");
        }
    }

    /// Delete every session belonging to `user`
    pub fn invalidate_user_sessions(&self, user: &str) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let ids = self
            .user_index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user)
            .unwrap_or_default();
        let removed = ids.iter().filter(|id| sessions.remove(id.as_str()).is_some()).count();
        if removed > 0 {
            tracing::info!(user = user, count = removed, "Invalidated user sessions");
        }
        removed
    }

    pub fn untrack_user_session(&self, user: &str, id: &str) {
        let mut index = self.user_index.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(ids) = index.get_mut(user) {
            ids.retain(|existing| existing != id);
            if ids.is_empty() {
                index.remove(user);
            }
        }
    }

    /// Drop expired sessions and their index entries
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, s| now < s.expires_at);
        let removed = before - sessions.len();

        let mut index = self.user_index.write().unwrap_or_else(PoisonError::into_inner);
        index.retain(|_, ids| {
            ids.retain(|id| sessions.contains_key(id));
            !ids.is_empty()
        });
        removed
    }

    #[cfg(test)]
    fn session_ids_for(&self, user: &str) -> Vec<String> {
        self.user_index.read().unwrap().get(user).cloned().unwrap_or_default()
    }
}
