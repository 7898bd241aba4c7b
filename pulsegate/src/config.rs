//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `PULSE_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `PULSE_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `PULSE_AUTH__PROXY__SECRET=s3cret` sets the `auth.proxy.secret` field.
//!
//! ## Usage
//!
//! ```no_run
//! use clap::Parser;
//! use pulsegate::config::{Args, Config};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let args = Args::parse();
//! let config = Config::load(&args)?;
//!
//! println!("Gateway will bind to {}:{}", config.host, config.port);
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration Structure
//!
//! - **Server**: `host`, `port`, `data_path`
//! - **Network**: `trusted_proxy_cidrs` - peers allowed to assert `X-Forwarded-*` headers
//! - **Authentication**: `auth.username`, `auth.password_hash`, `auth.proxy`, `auth.session`
//! - **Security**: `security.lockout`, `security.allow_embedding`
//! - **Telemetry**: `log_format`, `enable_otel_export`
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! # Trust a load balancer subnet (comma separated list is accepted)
//! PULSE_TRUSTED_PROXY_CIDRS="10.0.0.0/8,192.168.1.10"
//!
//! # Reverse-proxy authentication
//! PULSE_AUTH__PROXY__SECRET=change-me
//! PULSE_AUTH__PROXY__USER_HEADER=X-Remote-User
//!
//! # Stricter lockout
//! PULSE_SECURITY__LOCKOUT__MAX_FAILED_ATTEMPTS=3
//! ```

use argon2::password_hash::PasswordHash;
use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Deserializer, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::errors::Error;

/// CLI args: config file location plus one-shot maintenance flags
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "PULSE_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,

    /// Print an argon2 hash of the given password for `auth.password_hash` and exit.
    #[arg(long, value_name = "PASSWORD")]
    pub hash_password: Option<String>,
}

/// Main application configuration.
///
/// All fields have sensible defaults defined in the `Default` implementation, so an empty
/// configuration file starts the gateway in open mode on `0.0.0.0:7655`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Directory holding the bootstrap token and persisted API tokens
    pub data_path: PathBuf,
    /// Log output format
    pub log_format: LogFormat,
    /// Export traces via OTLP (endpoint configured through the standard `OTEL_*` variables)
    pub enable_otel_export: bool,
    /// CIDRs or bare IPs of proxies allowed to assert forwarded client headers.
    /// Accepts a YAML list or a comma separated string.
    #[serde(deserialize_with = "list_or_csv")]
    pub trusted_proxy_cidrs: Vec<String>,
    pub auth: AuthConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Fmt,
    Json,
}

/// Authentication mechanisms. A mechanism is active when its settings are present; when none is,
/// the gateway runs in open mode.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Username for HTTP Basic / login authentication
    pub username: Option<String>,
    /// Argon2 PHC string for the password
    pub password_hash: Option<String>,
    /// Header carrying an API token
    pub api_token_header: String,
    /// Where API token records are persisted (default: `<data_path>/api_tokens.json`)
    pub api_tokens_file: Option<PathBuf>,
    /// Header naming the organization a request targets
    pub org_header: String,
    /// Whether a Basic-authenticated user is an administrator when no proxy role header is configured
    pub basic_auth_grants_admin: bool,
    pub proxy: ProxyAuthConfig,
    /// A session may have been minted by the OIDC flow
    pub oidc_enabled: bool,
    /// A session may have been minted by the SAML flow
    pub saml_enabled: bool,
    pub session: SessionConfig,
}

/// Reverse-proxy asserted identity
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyAuthConfig {
    /// Shared secret the proxy must present; proxy auth is disabled without it
    pub secret: Option<String>,
    pub secret_header: String,
    /// Header carrying the authenticated username
    pub user_header: Option<String>,
    /// Header carrying the user's roles
    pub role_header: Option<String>,
    /// Role that grants administrative access
    pub admin_role: Option<String>,
    /// Separator between roles in `role_header`
    pub role_separator: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub cookie_name: String,
    pub csrf_cookie_name: String,
    /// Sliding session lifetime
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Oldest sessions beyond this count are evicted on login
    pub max_sessions_per_user: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityConfig {
    /// Allow the UI to be framed
    pub allow_embedding: bool,
    /// Origins allowed to frame the UI when embedding is enabled
    pub allowed_embed_origins: Vec<String>,
    pub lockout: LockoutConfig,
    /// Lifetime of administrator-issued recovery tokens
    #[serde(with = "humantime_serde")]
    pub recovery_token_ttl: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockoutConfig {
    /// Failures before an identifier is locked
    pub max_failed_attempts: u32,
    /// How long a lock lasts
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// How often expired ledger entries are purged
    #[serde(with = "humantime_serde")]
    pub gc_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7655,
            data_path: PathBuf::from("/etc/pulse"),
            log_format: LogFormat::default(),
            enable_otel_export: false,
            trusted_proxy_cidrs: Vec::new(),
            auth: AuthConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: None,
            password_hash: None,
            api_token_header: "X-API-Token".to_string(),
            api_tokens_file: None,
            org_header: "X-Pulse-Org-ID".to_string(),
            basic_auth_grants_admin: true,
            proxy: ProxyAuthConfig::default(),
            oidc_enabled: false,
            saml_enabled: false,
            session: SessionConfig::default(),
        }
    }
}

impl Default for ProxyAuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            secret_header: "X-Proxy-Secret".to_string(),
            user_header: None,
            role_header: None,
            admin_role: None,
            role_separator: "|".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "pulse_session".to_string(),
            csrf_cookie_name: "pulse_csrf".to_string(),
            timeout: Duration::from_secs(24 * 60 * 60), // 24 hours
            max_sessions_per_user: 10,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allow_embedding: false,
            allowed_embed_origins: Vec::new(),
            lockout: LockoutConfig::default(),
            recovery_token_ttl: Duration::from_secs(60 * 60),
        }
    }
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: 5,
            duration: Duration::from_secs(15 * 60),
            gc_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl AuthConfig {
    /// Username/password authentication is configured
    pub fn password_enabled(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty()) && self.password_hash.as_deref().is_some_and(|h| !h.is_empty())
    }

    /// Reverse-proxy authentication is configured
    pub fn proxy_enabled(&self) -> bool {
        self.proxy.secret.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// A role header and admin role are both configured for proxy auth
    pub fn proxy_roles_enabled(&self) -> bool {
        self.proxy.role_header.is_some() && self.proxy.admin_role.is_some()
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.auth.username.as_deref().is_some_and(|u| !u.is_empty()) {
            let Some(hash) = self.auth.password_hash.as_deref().filter(|h| !h.is_empty()) else {
                return Err(Error::Internal {
                    operation: "Config validation: auth.username is set but auth.password_hash is not configured. \
                     Set PULSE_AUTH__PASSWORD_HASH to an argon2 hash of the password."
                        .to_string(),
                });
            };

            if let Err(e) = PasswordHash::new(hash) {
                return Err(Error::Internal {
                    operation: format!("Config validation: auth.password_hash is not a valid password hash: {e}"),
                });
            }
        }

        if self.auth.proxy_enabled() && self.auth.proxy.user_header.as_deref().is_none_or(str::is_empty) {
            return Err(Error::Internal {
                operation: "Config validation: auth.proxy.secret is set but auth.proxy.user_header is not configured".to_string(),
            });
        }

        if self.security.lockout.max_failed_attempts == 0 {
            return Err(Error::Internal {
                operation: "Config validation: security.lockout.max_failed_attempts must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can override specific values. PULSE_CONFIG and PULSE_DEV
            // are read elsewhere and are not config keys.
            .merge(Env::prefixed("PULSE_").split("__").ignore(&["config", "dev"]))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Location of the persisted API token records
    pub fn api_tokens_path(&self) -> PathBuf {
        self.auth
            .api_tokens_file
            .clone()
            .unwrap_or_else(|| self.data_path.join("api_tokens.json"))
    }
}

fn list_or_csv<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrCsv {
        List(Vec<String>),
        Csv(String),
    }

    let entries = match ListOrCsv::deserialize(deserializer)? {
        ListOrCsv::List(list) => list,
        ListOrCsv::Csv(csv) => csv.split(',').map(str::to_string).collect(),
    };
    Ok(entries
        .into_iter()
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect())
}
