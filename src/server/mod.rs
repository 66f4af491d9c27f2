//! HTTP surface
//!
//! An axum router exposing stream-start (SSE), permission resolution,
//! cancellation, and session status. Rate limiting wraps the whole router;
//! `/health` is exempt inside the middleware.

mod handlers;

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::orchestrator::Orchestrator;
use crate::ratelimit::{self, RateLimitState};

/// Shared state of the request handlers
#[derive(Clone)]
pub struct AppState {
    /// Owner of every live turn
    pub orchestrator: Orchestrator,
    /// Interval between SSE keep-alive comments
    pub keep_alive: Duration,
}

impl AppState {
    /// Create handler state
    #[must_use]
    pub const fn new(orchestrator: Orchestrator, keep_alive: Duration) -> Self {
        Self {
            orchestrator,
            keep_alive,
        }
    }
}

/// Build the full router.
pub fn build_app(state: AppState, limits: RateLimitState) -> Router {
    let sessions = Router::new()
        .route("/sessions/{session_id}", get(handlers::session_state))
        .route("/sessions/{session_id}/stream", post(handlers::start_stream))
        .route(
            "/sessions/{session_id}/permissions",
            get(handlers::pending_permission).post(handlers::resolve_permission),
        )
        .route("/sessions/{session_id}/cancel", post(handlers::cancel_turn));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", sessions)
        .with_state(state)
        .layer(middleware::from_fn_with_state(limits, ratelimit::enforce))
}

/// Serve `app` on `listener` until `shutdown` resolves.
///
/// Client addresses are exposed to the rate-limit middleware through
/// `ConnectInfo`.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening");
    }
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}
