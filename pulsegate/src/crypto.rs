//! Secret generation and comparison primitives.
//!
//! Every opaque credential in the gateway (session IDs, CSRF tokens, API tokens, recovery and
//! bootstrap tokens) is produced here from the thread-local CSPRNG, and every comparison of a
//! presented secret against a stored one goes through [`constant_time_eq`] so that mismatches in
//! length and mismatches in content are indistinguishable by timing.

use rand::prelude::RngExt;
use rand::rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Generate `len` random bytes, hex-encoded (so the result is `2 * len` characters).
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rng().fill(&mut bytes[..]);
    hex_encode(&bytes)
}

/// SHA-256 digest of `input`, hex-encoded.
pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex_encode(&digest)
}

/// Compare two secrets without leaking where they differ.
///
/// Both sides are hashed first so that the comparison always runs over 32 bytes regardless of the
/// length of the presented value.
pub fn constant_time_eq(presented: &str, expected: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.ct_eq(&b).into()
}

/// Compare a presented secret against a stored SHA-256 hex digest.
pub fn matches_sha256(presented: &str, stored_hash: &str) -> bool {
    let computed = sha256_hex(presented);
    computed.as_bytes().ct_eq(stored_hash.as_bytes()).into()
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
