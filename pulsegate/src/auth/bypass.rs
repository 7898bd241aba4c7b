//! Development-only admin bypass.
//!
//! Enabled only when `ALLOW_ADMIN_BYPASS=1` is set together with a development flag
//! (`PULSE_DEV=true` or `NODE_ENV=development`). The decision is made once per process; an opt-in
//! without the development flag is logged as declined.

use crate::memo::Memoized;

pub const ADMIN_BYPASS_ENV: &str = "ALLOW_ADMIN_BYPASS";
pub const DEV_MODE_ENV: &str = "PULSE_DEV";
pub const NODE_ENV: &str = "NODE_ENV";

static BYPASS: Memoized<bool> = Memoized::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassDecision {
    /// Opt-in flag not set
    Off,
    /// Opt-in set outside development mode
    Declined,
    Enabled,
}

/// Pure decision from the raw environment values
pub fn decide(opt_in: Option<&str>, pulse_dev: Option<&str>, node_env: Option<&str>) -> BypassDecision {
    if opt_in != Some("1") {
        return BypassDecision::Off;
    }
    let dev = pulse_dev == Some("true") || node_env.is_some_and(|v| v.eq_ignore_ascii_case("development"));
    if dev {
        BypassDecision::Enabled
    } else {
        BypassDecision::Declined
    }
}

fn decide_from_env() -> bool {
    let var = |name| std::env::var(name).ok();
    match decide(
        var(ADMIN_BYPASS_ENV).as_deref(),
        var(DEV_MODE_ENV).as_deref(),
        var(NODE_ENV).as_deref(),
    ) {
        BypassDecision::Off => false,
        BypassDecision::Declined => {
            tracing::warn!("Ignoring ALLOW_ADMIN_BYPASS outside development mode");
            false
        }
        BypassDecision::Enabled => {
            tracing::warn!("Admin authentication bypass ENABLED (development mode)");
            true
        }
    }
}

/// Whether every request is treated as an authenticated administrator
pub fn admin_bypass_enabled() -> bool {
    *BYPASS.get_or_init(decide_from_env)
}

/// Forget the memoized decision
pub fn reset_admin_bypass() {
    BYPASS.reset();
}
