//! Authentication and authorization.
//!
//! Every protected request goes through the [`engine::AuthEngine`], which tries each configured
//! credential mechanism in precedence order and produces an [`identity::Identity`]:
//!
//! - **Admin bypass** (`ALLOW_ADMIN_BYPASS=1` in development only)
//! - **Open mode**: nothing configured, every request is an anonymous admin; the one-shot
//!   bootstrap token in `X-Setup-Token` identifies first-run setup
//! - **Recovery tokens**: single-use, short-lived, issued by an administrator
//! - **Proxy authentication**: a reverse proxy asserts the user with a shared secret
//! - **API tokens**: scoped, optionally organization-bound, stored hashed
//! - **HTTP Basic**: the configured username and Argon2 password hash
//! - **Sessions**: cookies minted by `/api/login` or an SSO flow
//!
//! Route protection lives in [`middleware`], and cookie-authenticated writes are additionally
//! guarded by the double-submit check in [`csrf`]. Failed password attempts feed the
//! [`lockout`] ledger, keyed by username and by client IP.
//!
//! # Usage in Handlers
//!
//! ```ignore
//! use pulsegate::auth::identity::Identity;
//!
//! async fn handler(identity: Identity) -> String {
//!     format!("hello {}", identity.username)
//! }
//! ```

pub mod bootstrap;
pub mod bypass;
pub mod cookies;
pub mod csrf;
pub mod engine;
pub mod evaluators;
pub mod identity;
pub mod lockout;
pub mod middleware;
pub mod password;
pub mod recovery;
pub mod session;
pub mod token_store;
pub mod tokens;
