//! Log-safe rendering of secrets.

/// Number of leading characters of a secret that may appear in logs.
pub const LOG_PREFIX_LEN: usize = 8;

/// Return at most `len` leading characters of `value` followed by `...`.
///
/// Values no longer than `len` are fully masked so short secrets never appear whole.
pub fn safe_prefix(value: &str, len: usize) -> String {
    if value.chars().count() <= len {
        return "***".to_string();
    }
    let prefix: String = value.chars().take(len).collect();
    format!("{prefix}...")
}

/// [`safe_prefix`] with the default log prefix length.
pub fn redacted(value: &str) -> String {
    safe_prefix(value, LOG_PREFIX_LEN)
}
