//! Set-Cookie construction and cookie lookup.

use axum::http::{HeaderMap, HeaderValue, header};
use std::time::Duration;

use crate::net::client_ip::ClientIp;

/// CSRF cookies outlive a single page load but are reissued on demand
const CSRF_COOKIE_MAX_AGE: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Lax,
    None,
}

impl SameSite {
    fn as_str(self) -> &'static str {
        match self {
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

/// Transport-dependent cookie attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CookieSettings {
    pub secure: bool,
    pub same_site: SameSite,
}

impl CookieSettings {
    /// `Secure` for confirmed HTTPS. `SameSite=None` only when secure and behind a trusted proxy,
    /// which is how embedded deployments reach the UI cross-site.
    pub fn for_client(client: &ClientIp) -> Self {
        let same_site = if client.secure && client.via_trusted_proxy {
            SameSite::None
        } else {
            SameSite::Lax
        };
        Self {
            secure: client.secure,
            same_site,
        }
    }
}

fn build(name: &str, value: &str, max_age: i64, http_only: bool, settings: CookieSettings) -> HeaderValue {
    let mut cookie = format!("{name}={value}; Path=/; Max-Age={max_age}; SameSite={}", settings.same_site.as_str());
    if http_only {
        cookie.push_str("; HttpOnly");
    }
    if settings.secure {
        cookie.push_str("; Secure");
    }
    // Names come from configuration and values are hex, so this only fails on a bad cookie name
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| HeaderValue::from_static("invalid-cookie=; Max-Age=0"))
}

pub fn session_cookie(name: &str, session_id: &str, lifetime: Duration, settings: CookieSettings) -> HeaderValue {
    build(name, session_id, lifetime.as_secs() as i64, true, settings)
}

/// CSRF cookies stay readable from script so the UI can echo them
pub fn csrf_cookie(name: &str, token: &str, settings: CookieSettings) -> HeaderValue {
    build(name, token, CSRF_COOKIE_MAX_AGE as i64, false, settings)
}

pub fn clear_cookie(name: &str, http_only: bool, settings: CookieSettings) -> HeaderValue {
    build(name, "", 0, http_only, settings)
}

/// Value of cookie `name`, if present and non-empty
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn client(secure: bool, via_trusted_proxy: bool) -> ClientIp {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        ClientIp {
            ip,
            peer: ip,
            via_trusted_proxy,
            secure,
        }
    }

    #[test]
    fn test_settings_follow_transport() {
        assert_eq!(
            CookieSettings::for_client(&client(false, false)),
            CookieSettings {
                secure: false,
                same_site: SameSite::Lax
            }
        );
        assert_eq!(CookieSettings::for_client(&client(true, false)).same_site, SameSite::Lax);
        assert_eq!(CookieSettings::for_client(&client(true, true)).same_site, SameSite::None);
        // Plain HTTP never gets SameSite=None, which browsers reject without Secure
        assert_eq!(CookieSettings::for_client(&client(false, true)).same_site, SameSite::Lax);
    }

    #[test]
    fn test_session_cookie_attributes() {
        let settings = CookieSettings::for_client(&client(true, false));
        let cookie = session_cookie("pulse_session", "abc", Duration::from_secs(60), settings);
        assert_eq!(
            cookie.to_str().unwrap(),
            "pulse_session=abc; Path=/; Max-Age=60; SameSite=Lax; HttpOnly; Secure"
        );
    }

    #[test]
    fn test_csrf_and_clear_cookies() {
        let settings = CookieSettings::for_client(&client(false, false));
        let csrf = csrf_cookie("pulse_csrf", "tok", settings);
        assert!(!csrf.to_str().unwrap().contains("HttpOnly"));
        assert!(csrf.to_str().unwrap().contains("Max-Age=86400"));

        let cleared = clear_cookie("pulse_csrf", false, settings);
        assert_eq!(cleared.to_str().unwrap(), "pulse_csrf=; Path=/; Max-Age=0; SameSite=Lax");
    }

    #[test]
    fn test_read_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("theme=dark; pulse_session=s1"));
        headers.append(header::COOKIE, HeaderValue::from_static("pulse_csrf=c1"));
        assert_eq!(read_cookie(&headers, "pulse_session").as_deref(), Some("s1"));
        assert_eq!(read_cookie(&headers, "pulse_csrf").as_deref(), Some("c1"));
        assert_eq!(read_cookie(&headers, "missing"), None);

        let mut empty = HeaderMap::new();
        empty.insert(header::COOKIE, HeaderValue::from_static("pulse_session="));
        assert_eq!(read_cookie(&empty, "pulse_session"), None);
    }
}
