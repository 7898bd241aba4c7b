//! API layer for HTTP request handling and data models.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Request/response data structures
//!
//! # API Structure
//!
//! - **Public**: `/api/health`, `/api/login`, `/api/security/status`,
//!   `/api/security/validate-bootstrap-token`
//! - **Authenticated**: `/api/me`, `/api/logout`
//! - **Admin** (`/api/security/*`): API tokens, lockout inspection and reset, recovery tokens
//!
//! # OpenAPI Documentation
//!
//! All endpoints are documented with `utoipa`; the document is served at `/api/openapi.json`.

pub mod handlers;
pub mod models;
