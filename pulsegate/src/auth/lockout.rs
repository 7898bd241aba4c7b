//! Failed-login ledger.
//!
//! Identifiers are usernames or client IPs. An identifier is locked once its failure count reaches
//! the configured maximum and stays locked until the lock window elapses; after that it is
//! reported as if it had never failed, even before garbage collection removes the entry.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use utoipa::ToSchema;

use crate::config::LockoutConfig;

#[derive(Debug, Clone)]
struct FailedLogin {
    count: u32,
    last_attempt: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
}

/// Lockout state of one identifier as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct LockoutInfo {
    pub attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub locked: bool,
}

impl LockoutInfo {
    fn clear() -> Self {
        Self {
            attempts: 0,
            locked_until: None,
            locked: false,
        }
    }
}

#[derive(Debug)]
pub struct LockoutLedger {
    entries: RwLock<HashMap<String, FailedLogin>>,
    max_attempts: u32,
    duration: Duration,
}

impl LockoutLedger {
    pub fn new(config: &LockoutConfig) -> Self {
        Self::with_limits(config.max_failed_attempts, config.duration)
    }

    pub fn with_limits(max_attempts: u32, duration: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_attempts: max_attempts.max(1),
            duration,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn window_end(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.duration)
            .ok()
            .and_then(|d| from.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// A lock whose window has passed no longer counts
    fn lapsed(&self, entry: &FailedLogin, now: DateTime<Utc>) -> bool {
        entry.count >= self.max_attempts && entry.locked_until.is_none_or(|until| now >= until)
    }

    /// Count one failure for `identifier` and return the resulting state.
    pub fn record_failure(&self, identifier: &str) -> LockoutInfo {
        let now = Utc::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(identifier.to_string()).or_insert(FailedLogin {
            count: 0,
            last_attempt: now,
            locked_until: None,
        });

        if self.lapsed(entry, now) {
            entry.count = 0;
            entry.locked_until = None;
        }

        entry.count += 1;
        entry.last_attempt = now;

        if entry.count >= self.max_attempts && entry.locked_until.is_none() {
            let until = self.window_end(now);
            entry.locked_until = Some(until);
            tracing::warn!(
                identifier = identifier,
                attempts = entry.count,
                locked_until = %until,
                "Account locked due to failed login attempts"
            );
        }

        LockoutInfo {
            attempts: entry.count,
            locked_until: entry.locked_until,
            locked: entry.locked_until.is_some_and(|until| now < until),
        }
    }

    /// Current state of `identifier`. Never extends a lock.
    pub fn info(&self, identifier: &str) -> LockoutInfo {
        let now = Utc::now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get(identifier) else {
            return LockoutInfo::clear();
        };
        if self.lapsed(entry, now) {
            return LockoutInfo::clear();
        }
        LockoutInfo {
            attempts: entry.count,
            locked_until: entry.locked_until,
            locked: entry.count >= self.max_attempts && entry.locked_until.is_some_and(|until| now < until),
        }
    }

    pub fn is_locked(&self, identifier: &str) -> bool {
        self.info(identifier).locked
    }

    /// Forget `identifier` after a successful authentication
    pub fn clear(&self, identifier: &str) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).remove(identifier);
    }

    /// Administrative override
    pub fn reset(&self, identifier: &str) {
        let removed = self.entries.write().unwrap_or_else(PoisonError::into_inner).remove(identifier);
        tracing::info!(identifier = identifier, existed = removed.is_some(), "Lockout manually reset");
    }

    /// Drop lapsed locks and sub-threshold entries idle for longer than the lock window.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| {
            if entry.count >= self.max_attempts {
                !self.lapsed(entry, now)
            } else {
                now < self.window_end(entry.last_attempt)
            }
        });
        before - entries.len()
    }

    #[cfg(test)]
    fn force_expire(&self, identifier: &str) {
        if let Some(entry) = self.entries.write().unwrap().get_mut(identifier) {
            entry.locked_until = Some(Utc::now() - TimeDelta::seconds(1));
            entry.last_attempt = Utc::now() - TimeDelta::hours(1);
        }
    }
}
