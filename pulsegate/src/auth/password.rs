//! Password hashing, verification and HTTP Basic credential parsing.

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use axum::http::{HeaderMap, header};
use base64::{Engine as _, engine::general_purpose};

use crate::config::AuthConfig;
use crate::crypto;
use crate::errors::Error;

/// Argon2id cost for hashing the administrator password.
///
/// Only `--hash-password` and tests create hashes; verification takes its cost from the stored
/// PHC string, so changing the default never invalidates an existing `auth.password_hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashCost {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashCost {
    fn default() -> Self {
        Self {
            memory_kib: 19456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl HashCost {
    /// Minimal cost, so tests do not spend seconds hashing
    pub const CHEAP: Self = Self {
        memory_kib: 128,
        iterations: 1,
        parallelism: 1,
    };
}

/// Produce the PHC string stored in `auth.password_hash`
pub fn hash_password(password: &str, cost: HashCost) -> Result<String, Error> {
    let params = Params::new(cost.memory_kib, cost.iterations, cost.parallelism, None).map_err(|e| Error::Internal {
        operation: format!("argon2 cost {cost:?}: {e}"),
    })?;
    let salt = SaltString::generate(&mut OsRng);
    let phc = Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| Error::Internal {
            operation: format!("hash admin password: {e}"),
        })?;
    Ok(phc.to_string())
}

/// A malformed stored hash is a configuration error, not a failed login
fn password_matches(password: &str, phc: &str) -> Result<bool, Error> {
    let stored = PasswordHash::new(phc).map_err(|e| Error::Internal {
        operation: format!("parse auth.password_hash: {e}"),
    })?;
    Ok(Argon2::default().verify_password(password.as_bytes(), &stored).is_ok())
}

/// Check a username/password pair against the configured credentials.
///
/// The username comparison is case-sensitive and constant time, and the password hash is always
/// verified so a wrong username costs the same as a wrong password.
pub fn verify_credentials(auth: &AuthConfig, username: &str, password: &str) -> Result<bool, Error> {
    let (Some(expected_user), Some(hash)) = (auth.username.as_deref(), auth.password_hash.as_deref()) else {
        return Ok(false);
    };
    let user_ok = crypto::constant_time_eq(username, expected_user);
    let password_ok = password_matches(password, hash)?;
    Ok(user_ok && password_ok)
}

/// Decode `Authorization: Basic` credentials
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = general_purpose::STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}
