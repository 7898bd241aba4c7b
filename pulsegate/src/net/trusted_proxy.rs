//! Registry of peers allowed to assert forwarded client headers.

use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;

use crate::memo::Memoized;

/// Environment variable read when the registry is first consulted without explicit installation.
pub const TRUSTED_PROXY_ENV: &str = "PULSE_TRUSTED_PROXY_CIDRS";

/// Parsed set of trusted proxy networks.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxySet {
    networks: Vec<IpNet>,
}

impl TrustedProxySet {
    /// Parse CIDRs and bare addresses. Invalid entries are logged and skipped.
    ///
    /// Bare addresses are widened to a single-address network (/32 or /128) and CIDRs with host
    /// bits set are truncated to their network address.
    pub fn parse<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut networks = Vec::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }

            if entry.contains('/') {
                match entry.parse::<IpNet>() {
                    Ok(net) => networks.push(net.trunc()),
                    Err(e) => tracing::warn!(cidr = entry, error = %e, "Ignoring invalid trusted proxy CIDR"),
                }
                continue;
            }

            match entry.parse::<IpAddr>() {
                Ok(ip) => networks.push(IpNet::from(ip.to_canonical())),
                Err(_) => tracing::warn!(value = entry, "Ignoring invalid trusted proxy IP"),
            }
        }

        if !networks.is_empty() {
            tracing::debug!(count = networks.len(), "Loaded trusted proxy networks");
        }
        Self { networks }
    }

    /// Parse a comma separated list, as found in the environment
    pub fn from_csv(raw: &str) -> Self {
        Self::parse(raw.split(','))
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.networks.iter().any(|net| net.contains(&ip))
    }

    pub fn networks(&self) -> &[IpNet] {
        &self.networks
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

static REGISTRY: Memoized<TrustedProxySet> = Memoized::new();

/// Process-wide trusted proxy set.
///
/// Computed at most once: from whatever [`install_trusted_proxies`] was given, or lazily from
/// `PULSE_TRUSTED_PROXY_CIDRS` if nothing was installed.
pub fn trusted_proxies() -> Arc<TrustedProxySet> {
    REGISTRY.get_or_init(|| {
        let raw = std::env::var(TRUSTED_PROXY_ENV).unwrap_or_default();
        TrustedProxySet::from_csv(&raw)
    })
}

/// Install the configured trusted proxy set for the process.
pub fn install_trusted_proxies<I, S>(entries: I) -> Arc<TrustedProxySet>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    REGISTRY.set(TrustedProxySet::parse(entries))
}

/// Forget the memoized set so the next lookup recomputes it.
pub fn reset_trusted_proxies() {
    REGISTRY.reset();
}

/// Whether `ip` may assert forwarded headers according to the process-wide registry
pub fn is_trusted_proxy(ip: IpAddr) -> bool {
    trusted_proxies().contains(ip)
}
