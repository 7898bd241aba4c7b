//! HTTP request handlers.
//!
//! Handlers sit behind the gates assembled in [`crate::build_router`]; they receive the
//! authenticated [`Identity`](crate::auth::identity::Identity) through its extractor and never
//! re-run authentication themselves.

pub mod auth;
pub mod health;
pub mod security;
pub mod tokens;
