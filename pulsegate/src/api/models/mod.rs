//! Request and response data structures.

pub mod auth;
pub mod security;
pub mod tokens;
