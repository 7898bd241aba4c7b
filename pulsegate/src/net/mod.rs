//! Peer address parsing and classification.
//!
//! Everything downstream (lockout keys, trusted-proxy decisions, audit lines) keys on a bare
//! [`IpAddr`], so addresses arriving with ports, brackets or zone identifiers are normalized here.
//! IPv4-mapped IPv6 addresses are canonicalized to IPv4 before any range check.

pub mod client_ip;
pub mod trusted_proxy;

use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Parse a peer address that may carry a port, brackets or an IPv6 zone.
///
/// Accepts `1.2.3.4`, `1.2.3.4:5678`, `::1`, `[::1]`, `[::1]:443`, `fe80::1%eth0`.
pub fn normalize_peer(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let host = if let Some(rest) = raw.strip_prefix('[') {
        // [v6] or [v6]:port
        rest.split_once(']').map(|(host, _)| host)?
    } else if raw.matches(':').count() == 1 {
        // v4:port
        raw.split_once(':').map(|(host, _)| host)?
    } else {
        raw
    };

    let host = host.split_once('%').map_or(host, |(addr, _zone)| addr);
    host.parse::<IpAddr>().ok().map(|ip| ip.to_canonical())
}

/// Parse a single forwarded-header entry. Only bare addresses are accepted; entries with a port
/// suffix are rejected so a forwarded value can never smuggle one in.
pub fn parse_forwarded_entry(raw: &str) -> Option<IpAddr> {
    let entry = raw.trim().trim_start_matches('[').trim_end_matches(']').trim();
    if entry.is_empty() {
        return None;
    }
    entry.parse::<IpAddr>().ok().map(|ip| ip.to_canonical())
}

/// Loopback, RFC 1918, unique-local and link-local ranges.
pub fn is_private_or_reserved(ip: IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    // 10/8, 172.16/12, 192.168/16, 127/8, 169.254/16, 224.0.0/24
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || (ip.octets()[..3] == [224, 0, 0])
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        // fc00::/7
        || (first & 0xfe00) == 0xfc00
        // fe80::/10
        || (first & 0xffc0) == 0xfe80
        // ff02::/16
        || first == 0xff02
}

/// Whether `ip` belongs to a trusted network.
///
/// With an empty `custom` list only private, loopback and link-local peers are trusted.
pub fn is_trusted_network(ip: IpAddr, custom: &[IpNet]) -> bool {
    if custom.is_empty() {
        return is_private_or_reserved(ip);
    }
    let ip = ip.to_canonical();
    custom.iter().any(|net| net.contains(&ip))
}
