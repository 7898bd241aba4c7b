//! Administrator-issued single-use recovery tokens.
//!
//! Redemption checks under a shared lock first and then re-checks the used flag after taking the
//! exclusive lock, so two concurrent requests presenting the same token cannot both succeed.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use crate::crypto;

pub const RECOVERY_TOKEN_HEADER: &str = "x-recovery-token";

#[derive(Debug, Clone)]
struct RecoveryToken {
    hash: String,
    expires_at: DateTime<Utc>,
    used_at: Option<DateTime<Utc>>,
    used_by: Option<String>,
}

impl RecoveryToken {
    fn redeemable(&self, now: DateTime<Utc>) -> bool {
        self.used_at.is_none() && now < self.expires_at
    }
}

#[derive(Debug, Default)]
pub struct RecoveryTokenStore {
    tokens: RwLock<Vec<RecoveryToken>>,
}

impl RecoveryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a token valid for `ttl`. The raw value is returned once and never stored.
    pub fn generate(&self, ttl: Duration) -> (String, DateTime<Utc>) {
        let raw = crypto::random_hex(32);
        let now = Utc::now();
        let expires_at = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        tokens.retain(|t| now < t.expires_at);
        tokens.push(RecoveryToken {
            hash: crypto::sha256_hex(&raw),
            expires_at,
            used_at: None,
            used_by: None,
        });
        tracing::info!(expires_at = %expires_at, "Issued recovery token");
        (raw, expires_at)
    }

    /// Every live token is compared so timing does not reveal which one matched
    fn find(tokens: &[RecoveryToken], presented: &str, now: DateTime<Utc>) -> Option<usize> {
        let mut found = None;
        for (idx, token) in tokens.iter().enumerate() {
            if crypto::matches_sha256(presented, &token.hash) && token.redeemable(now) && found.is_none() {
                found = Some(idx);
            }
        }
        found
    }

    /// Who redeemed `presented`, if it is a token that has already been used
    fn previous_redemption(tokens: &[RecoveryToken], presented: &str) -> Option<(DateTime<Utc>, String)> {
        tokens
            .iter()
            .filter(|t| crypto::matches_sha256(presented, &t.hash))
            .find_map(|t| Some((t.used_at?, t.used_by.clone().unwrap_or_default())))
    }

    fn log_replay(tokens: &[RecoveryToken], presented: &str, client_ip: &str) {
        if let Some((used_at, used_by)) = Self::previous_redemption(tokens, presented) {
            tracing::warn!(
                client_ip = client_ip,
                redeemed_by = %used_by,
                redeemed_at = %used_at,
                "Recovery token replay rejected"
            );
        }
    }

    /// Consume `presented` if it is live and unused. Returns whether this call redeemed it.
    pub fn redeem(&self, presented: &str, client_ip: &str) -> bool {
        if presented.is_empty() {
            return false;
        }
        let now = Utc::now();

        {
            let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
            if Self::find(&tokens, presented, now).is_none() {
                Self::log_replay(&tokens, presented, client_ip);
                return false;
            }
        }

        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        // Another request may have redeemed it between the two locks
        let Some(idx) = Self::find(&tokens, presented, now) else {
            Self::log_replay(&tokens, presented, client_ip);
            return false;
        };
        let token = &mut tokens[idx];
        token.used_at = Some(now);
        token.used_by = Some(client_ip.to_string());
        tracing::warn!(client_ip = client_ip, "Recovery token redeemed");
        true
    }

    /// Tokens that can still be redeemed
    pub fn live_count(&self) -> usize {
        let now = Utc::now();
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|t| t.redeemable(now))
            .count()
    }

    /// Drop tokens past their expiry, used or not
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        let before = tokens.len();
        tokens.retain(|t| now < t.expires_at);
        before - tokens.len()
    }
}
