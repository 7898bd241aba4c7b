//! Resolution of the client address used for every security decision.
//!
//! Forwarded headers (`X-Forwarded-For`, `X-Real-IP`, `X-Forwarded-Proto`) are only honored when
//! the immediate peer is a trusted proxy. A request from an untrusted peer claiming
//! `X-Forwarded-For: 127.0.0.1` resolves to the peer itself.

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State, connect_info::MockConnectInfo},
    http::{Extensions, HeaderMap, request::Parts},
    middleware::Next,
    response::Response,
};
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use super::{parse_forwarded_entry, trusted_proxy::TrustedProxySet};
use crate::AppState;

/// Marker extension inserted by a TLS acceptor for connections it terminated itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsConnection;

/// Resolved client address and transport facts for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp {
    /// Address used for lockout keys and audit lines
    pub ip: IpAddr,
    /// Immediate TCP peer
    pub peer: IpAddr,
    /// The peer is a trusted proxy
    pub via_trusted_proxy: bool,
    /// Confirmed HTTPS, either terminated here or asserted by a trusted proxy
    pub secure: bool,
}

impl ClientIp {
    pub fn resolve(peer: IpAddr, headers: &HeaderMap, direct_tls: bool, proxies: &TrustedProxySet) -> Self {
        let via_trusted_proxy = proxies.contains(peer);
        Self {
            ip: resolve_client_ip(peer, headers, proxies),
            peer,
            via_trusted_proxy,
            secure: direct_tls || (via_trusted_proxy && forwarded_https(headers)),
        }
    }

    /// Resolve from request parts when no middleware has run
    fn from_parts(parts: &Parts, proxies: &TrustedProxySet) -> Self {
        Self::resolve(
            peer_addr(&parts.extensions),
            &parts.headers,
            parts.extensions.get::<TlsConnection>().is_some(),
            proxies,
        )
    }
}

/// Pick the address used for security decisions.
///
/// For a trusted peer: the first bare, valid IP in `X-Forwarded-For`, else a valid `X-Real-IP`,
/// else the peer. For any other peer: the peer.
pub fn resolve_client_ip(peer: IpAddr, headers: &HeaderMap, proxies: &TrustedProxySet) -> IpAddr {
    let peer = peer.to_canonical();
    if !proxies.contains(peer) {
        return peer;
    }

    let forwarded = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find_map(parse_forwarded_entry);
    if let Some(ip) = forwarded {
        return ip;
    }

    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .and_then(parse_forwarded_entry)
        .unwrap_or(peer)
}

/// First value of a possibly comma separated forwarded header, lowercased
fn first_forwarded_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(name)?.to_str().ok()?;
    let first = raw.split(',').next()?.trim();
    (!first.is_empty()).then(|| first.to_ascii_lowercase())
}

fn forwarded_https(headers: &HeaderMap) -> bool {
    first_forwarded_value(headers, "x-forwarded-proto")
        .or_else(|| first_forwarded_value(headers, "x-forwarded-scheme"))
        .is_some_and(|proto| proto == "https")
}

/// Immediate peer of the connection (real or mocked connect info), or the unspecified address
/// when the server was not started with connect info.
pub fn peer_addr(extensions: &Extensions) -> IpAddr {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
        .or_else(|| extensions.get::<MockConnectInfo<SocketAddr>>().map(|MockConnectInfo(addr)| *addr))
        .map(|addr| addr.ip().to_canonical())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Middleware resolving [`ClientIp`] once per request and storing it in request extensions.
pub async fn client_ip_middleware(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let client = ClientIp::resolve(
        peer_addr(request.extensions()),
        request.headers(),
        request.extensions().get::<TlsConnection>().is_some(),
        &state.proxies,
    );
    tracing::trace!(client_ip = %client.ip, peer = %client.peer, secure = client.secure, "Resolved client address");
    request.extensions_mut().insert(client);
    next.run(request).await
}

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(client) = parts.extensions.get::<ClientIp>() {
            return Ok(*client);
        }
        Ok(Self::from_parts(parts, &super::trusted_proxy::trusted_proxies()))
    }
}

/// The resolved client for `parts`, falling back to the state's proxy set when the middleware
/// did not run.
pub fn client_of(parts: &Parts, proxies: &TrustedProxySet) -> ClientIp {
    parts
        .extensions
        .get::<ClientIp>()
        .copied()
        .unwrap_or_else(|| ClientIp::from_parts(parts, proxies))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn proxies() -> TrustedProxySet {
        TrustedProxySet::parse(["10.0.0.0/8", "::1"])
    }

    #[test]
    fn test_untrusted_peer_ignores_forwarded_headers() {
        let forged = headers(&[("x-forwarded-for", "127.0.0.1"), ("x-real-ip", "10.0.0.1")]);
        let resolved = resolve_client_ip(ip("203.0.113.50"), &forged, &proxies());
        assert_eq!(resolved, ip("203.0.113.50"));
    }

    #[test]
    fn test_untrusted_peer_with_empty_registry() {
        // A loopback claim from a private but unconfigured peer is still ignored
        let forged = headers(&[("x-forwarded-for", "127.0.0.1")]);
        let resolved = resolve_client_ip(ip("192.168.1.20"), &forged, &TrustedProxySet::default());
        assert_eq!(resolved, ip("192.168.1.20"));
    }

    #[test]
    fn test_trusted_peer_uses_first_valid_forwarded() {
        let fwd = headers(&[("x-forwarded-for", "garbage, 198.51.100.7:8080, 198.51.100.8, 10.0.0.2")]);
        let resolved = resolve_client_ip(ip("10.1.1.1"), &fwd, &proxies());
        assert_eq!(resolved, ip("198.51.100.8"));
    }

    #[test]
    fn test_trusted_peer_multiple_forwarded_lines() {
        let fwd = headers(&[("x-forwarded-for", "bogus"), ("x-forwarded-for", "198.51.100.9")]);
        let resolved = resolve_client_ip(ip("10.1.1.1"), &fwd, &proxies());
        assert_eq!(resolved, ip("198.51.100.9"));
    }

    #[test]
    fn test_trusted_peer_falls_back_to_real_ip() {
        let fwd = headers(&[("x-forwarded-for", "nonsense"), ("x-real-ip", "[2001:db8::7]")]);
        let resolved = resolve_client_ip(ip("::1"), &fwd, &proxies());
        assert_eq!(resolved, ip("2001:db8::7"));
    }

    #[test]
    fn test_trusted_peer_invalid_headers_fall_back_to_peer() {
        let fwd = headers(&[("x-real-ip", "198.51.100.1:99")]);
        let resolved = resolve_client_ip(ip("10.0.0.9"), &fwd, &proxies());
        assert_eq!(resolved, ip("10.0.0.9"));
    }

    #[test]
    fn test_secure_only_from_trusted_peer() {
        let https = headers(&[("x-forwarded-proto", "HTTPS, http")]);

        let trusted = ClientIp::resolve(ip("10.0.0.3"), &https, false, &proxies());
        assert!(trusted.secure);
        assert!(trusted.via_trusted_proxy);

        let untrusted = ClientIp::resolve(ip("203.0.113.3"), &https, false, &proxies());
        assert!(!untrusted.secure);

        let direct = ClientIp::resolve(ip("203.0.113.3"), &HeaderMap::new(), true, &proxies());
        assert!(direct.secure);
        assert!(!direct.via_trusted_proxy);
    }

    #[test]
    fn test_forwarded_scheme_fallback() {
        let scheme = headers(&[("x-forwarded-scheme", "https")]);
        assert!(ClientIp::resolve(ip("10.0.0.3"), &scheme, false, &proxies()).secure);
    }

    #[test]
    fn test_peer_addr_from_connect_info() {
        let mut ext = Extensions::new();
        assert_eq!(peer_addr(&ext), ip("0.0.0.0"));
        ext.insert(ConnectInfo::<SocketAddr>("[::ffff:10.0.0.4]:5000".parse().unwrap()));
        assert_eq!(peer_addr(&ext), ip("10.0.0.4"));
    }
}
