//! # pulsegate: request-level security gateway for Pulse
//!
//! `pulsegate` decides, for every HTTP request reaching a Pulse server, who is calling and whether
//! they may proceed. It arbitrates between the configured credential mechanisms, resolves the real
//! client address behind trusted reverse proxies, enforces double-submit CSRF protection for
//! cookie-authenticated writes, and locks out usernames and addresses after repeated failures.
//!
//! ## Architecture
//!
//! The application is built on [Axum](https://github.com/tokio-rs/axum). All state lives in
//! memory except API token records, which are persisted to a JSON file, and the first-run
//! bootstrap token, which is written to the data directory.
//!
//! ### Request Flow
//!
//! Every request first passes through the outer layers: a request ID is assigned (or the
//! client's `X-Request-ID` kept), a tracing span is opened, the client address is resolved
//! once into a [`ClientIp`](net::client_ip::ClientIp) extension, and security headers are added
//! to the response. Protected routes then pass through a gate ([`auth::middleware`]) that asks
//! the [`AuthEngine`](auth::engine::AuthEngine) for an identity, and through the CSRF check
//! ([`auth::csrf`]) before reaching the handler.
//!
//! ### Core Components
//!
//! - [`net`]: peer normalization, trusted proxy registry, client address resolution
//! - [`auth`]: credential evaluators, the decision engine, gates, sessions, tokens, lockout
//! - [`api`]: login/logout, token, lockout, recovery and bootstrap endpoints
//! - [`security_headers`]: browser hardening headers and HSTS
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use pulsegate::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = pulsegate::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     pulsegate::telemetry::init_telemetry(config.log_format, config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.
pub mod api;
pub mod auth;
pub mod config;
mod crypto;
pub mod errors;
mod memo;
pub mod net;
mod openapi;
pub mod redact;
pub mod security_headers;
pub mod telemetry;

#[cfg(test)]
pub mod test_utils;

use axum::{
    Json, Router,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
};
use bon::Builder;
pub use config::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, error, info, warn};
use utoipa::OpenApi;

use crate::{
    api::handlers,
    auth::{
        bootstrap::BootstrapToken,
        bypass,
        csrf::{CsrfStore, csrf_middleware},
        engine::{AuthEngine, is_open_mode},
        lockout::LockoutLedger,
        middleware::{require_admin, require_auth},
        recovery::RecoveryTokenStore,
        session::SessionStore,
        token_store::{FileTokenPersistence, TokenStore},
    },
    net::{
        client_ip::client_ip_middleware,
        trusted_proxy::{TrustedProxySet, install_trusted_proxies},
    },
    openapi::ApiDoc,
    security_headers::security_headers,
};

/// Application state shared across all request handlers.
///
/// Every store is injected so tests can build isolated instances; nothing here reads
/// process-wide state on the request path.
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .config(Arc::new(config))
///     .tokens(Arc::new(tokens))
///     .sessions(Arc::new(SessionStore::new(&config.auth.session)))
///     .lockout(Arc::new(LockoutLedger::new(&config.security.lockout)))
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Arc<Config>,
    #[builder(default)]
    pub proxies: Arc<TrustedProxySet>,
    pub tokens: Arc<TokenStore>,
    pub sessions: Arc<SessionStore>,
    #[builder(default)]
    pub csrf: Arc<CsrfStore>,
    pub lockout: Arc<LockoutLedger>,
    #[builder(default)]
    pub recovery: Arc<RecoveryTokenStore>,
    /// Present only while the gateway starts in open mode
    pub bootstrap: Option<Arc<BootstrapToken>>,
    #[builder(default)]
    pub engine: Arc<AuthEngine>,
    /// Development admin bypass, decided once at startup
    #[builder(default = false)]
    pub admin_bypass: bool,
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Build the application router with all gates and outer layers.
pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/health", get(handlers::health::health))
        .route("/api/login", post(handlers::auth::login))
        .route(
            "/api/security/validate-bootstrap-token",
            post(handlers::security::validate_bootstrap_token),
        )
        .route("/api/security/status", get(handlers::security::security_status))
        .route("/api/openapi.json", get(openapi_json));

    // route_layer order: the gate runs first, then the CSRF check
    let authenticated = Router::new()
        .route("/api/me", get(handlers::auth::me))
        .route("/api/logout", post(handlers::auth::logout))
        .route_layer(from_fn_with_state(state.clone(), csrf_middleware))
        .route_layer(from_fn_with_state(state.clone(), require_auth));

    let admin = Router::new()
        .route(
            "/api/security/tokens",
            get(handlers::tokens::list_tokens).post(handlers::tokens::create_token),
        )
        .route("/api/security/tokens/{id}", delete(handlers::tokens::delete_token))
        .route("/api/security/tokens/{id}/rotate", post(handlers::tokens::rotate_token))
        .route("/api/security/lockout/{identifier}", get(handlers::security::get_lockout))
        .route("/api/security/reset-lockout", post(handlers::security::reset_lockout))
        .route(
            "/api/security/recovery-tokens",
            post(handlers::security::create_recovery_token),
        )
        .route_layer(from_fn_with_state(state.clone(), csrf_middleware))
        .route_layer(from_fn_with_state(state.clone(), require_admin));

    // ServiceBuilder applies top to bottom: the request ID exists before the span opens, and the
    // client address is resolved before security headers consult it
    Router::new()
        .merge(public)
        .merge(authenticated)
        .merge(admin)
        .with_state(state.clone())
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(from_fn_with_state(state.clone(), client_ip_middleware))
                .layer(from_fn_with_state(state, security_headers)),
        )
}

/// Counts from one garbage-collection pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub lockouts: usize,
    pub sessions: usize,
    pub recovery_tokens: usize,
}

/// Drop expired lockout entries, sessions and recovery tokens.
pub fn collect_expired(state: &AppState) -> GcReport {
    GcReport {
        lockouts: state.lockout.purge_expired(),
        sessions: state.sessions.purge_expired(),
        recovery_tokens: state.recovery.purge_expired(),
    }
}

/// Background tasks running alongside the HTTP server.
///
/// Dropping this without calling [`shutdown`](BackgroundServices::shutdown) still cancels the
/// tasks through the drop guard.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<tokio_util::sync::DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

fn setup_background_services(state: AppState, gc_interval: Duration, shutdown_token: CancellationToken) -> BackgroundServices {
    let drop_guard = shutdown_token.clone().drop_guard();
    let token = shutdown_token.clone();

    let gc = tokio::spawn(async move {
        let mut interval = tokio::time::interval(gc_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Expiry collector stopped");
                    break;
                }
                _ = interval.tick() => {
                    let report = collect_expired(&state);
                    if report != GcReport::default() {
                        debug!(?report, "Collected expired security state");
                    }
                }
            }
        }
    });

    BackgroundServices {
        background_tasks: vec![gc],
        shutdown_token,
        drop_guard: Some(drop_guard),
    }
}

/// Main application struct that owns all resources and lifecycle.
///
/// # Lifecycle
///
/// 1. **Create**: [`Application::new`] installs the trusted proxy set, loads persisted API
///    tokens, initializes the bootstrap token when nothing is configured, and starts the
///    expiry collector
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and starts handling requests
/// 3. **Shutdown**: When the shutdown signal is received, gracefully stops background tasks
pub struct Application {
    router: Router,
    app_state: AppState,
    config: Config,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting security gateway with configuration: {:#?}", config);

        let proxies = install_trusted_proxies(&config.trusted_proxy_cidrs);
        if proxies.is_empty() {
            info!("No trusted proxies configured; forwarded client headers will be ignored");
        }

        let persistence = Arc::new(FileTokenPersistence::new(config.api_tokens_path()));
        let tokens = TokenStore::load(persistence)?;
        info!(count = tokens.len(), path = %config.api_tokens_path().display(), "Loaded API tokens");

        let mut app_state = AppState::builder()
            .proxies(proxies)
            .tokens(Arc::new(tokens))
            .sessions(Arc::new(SessionStore::new(&config.auth.session)))
            .lockout(Arc::new(LockoutLedger::new(&config.security.lockout)))
            .admin_bypass(bypass::admin_bypass_enabled())
            .config(Arc::new(config.clone()))
            .build();

        if is_open_mode(&app_state) {
            match BootstrapToken::initialize(&config.data_path) {
                Ok(bootstrap) => app_state.bootstrap = Some(Arc::new(bootstrap)),
                Err(e) => error!(error = %e, "Failed to initialize bootstrap token; first-run setup is unavailable"),
            }
            warn!("No authentication configured: every request is treated as an administrator");
        }

        let lockout = &config.security.lockout;
        info!(
            max_failed_attempts = lockout.max_failed_attempts,
            lock_duration = %humantime::format_duration(lockout.duration),
            session_timeout = %humantime::format_duration(config.auth.session.timeout),
            "Lockout and session policy"
        );

        let shutdown_token = CancellationToken::new();
        let bg_services = setup_background_services(app_state.clone(), config.security.lockout.gc_interval, shutdown_token);
        let router = build_router(app_state.clone());

        Ok(Self {
            router,
            app_state,
            config,
            bg_services,
        })
    }

    /// Shared state, for embedding the gateway's stores elsewhere
    pub fn state(&self) -> &AppState {
        &self.app_state
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("Security gateway listening on http://{}", bind_addr);

        axum::serve(listener, self.router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await?;

        self.bg_services.shutdown().await;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();
        Ok(())
    }
}
