//! Test utilities: configurations, pre-wired state and in-process servers.

use axum::extract::connect_info::MockConnectInfo;
use axum_test::TestServer;
use base64::{Engine as _, engine::general_purpose};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::{
    AppState,
    auth::{
        lockout::LockoutLedger,
        password::{HashCost, hash_password},
        session::SessionStore,
        token_store::{MemoryTokenPersistence, TokenStore},
    },
    config::Config,
    net::trusted_proxy::TrustedProxySet,
};

/// Peer address used by [`test_server`]
pub const TEST_PEER: &str = "192.0.2.10:51000";

/// Defaults with nothing configured (open mode) and a throwaway data path
pub fn create_test_config() -> Config {
    Config {
        data_path: std::env::temp_dir().join(format!("pulsegate-test-{}", std::process::id())),
        ..Default::default()
    }
}

/// State with in-memory token persistence. Trusted proxies come from `config`, never from the
/// process-wide registry, so tests do not interfere with each other.
pub fn create_test_state(config: Config) -> AppState {
    AppState::builder()
        .proxies(Arc::new(TrustedProxySet::parse(&config.trusted_proxy_cidrs)))
        .tokens(Arc::new(TokenStore::new(Arc::new(MemoryTokenPersistence::default()))))
        .sessions(Arc::new(SessionStore::new(&config.auth.session)))
        .lockout(Arc::new(LockoutLedger::new(&config.security.lockout)))
        .config(Arc::new(config))
        .build()
}

/// Argon2 hash with minimal cost, for tests only
pub fn fast_hash(password: &str) -> String {
    hash_password(password, HashCost::CHEAP).unwrap()
}

/// `Authorization` header value for HTTP Basic
pub fn basic_header(username: &str, password: &str) -> String {
    format!("Basic {}", general_purpose::STANDARD.encode(format!("{username}:{password}")))
}

pub fn test_server(state: AppState) -> TestServer {
    test_server_with_peer(state, TEST_PEER.parse().unwrap())
}

/// Full router as served, with `peer` as the connecting address
pub fn test_server_with_peer(state: AppState, peer: SocketAddr) -> TestServer {
    let router = crate::build_router(state).layer(MockConnectInfo(peer));
    TestServer::new(router).unwrap()
}
