//! HTTP server implementation using Axum.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use chainmail_core::error::{ChainmailError, Result};
use chainmail_scheduler::ChainScheduler;

/// Shared state for the gateway server.
pub struct AppState {
    pub scheduler: Arc<ChainScheduler>,
    pub start_time: std::time::Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);
    Router::new()
        .route("/api/v1/health", get(super::routes::health_check))
        .route("/api/v1/info", get(super::routes::system_info))
        .route("/api/v1/chains/trigger", post(super::routes::trigger_chain))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(shared)
}

/// Bind and serve the gateway.
pub async fn serve(state: AppState, host: &str, port: u16) -> Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ChainmailError::Gateway(format!("bind {addr}: {e}")))?;

    tracing::info!("🚀 Gateway listening on {addr}");
    axum::serve(listener, build_router(state))
        .await
        .map_err(|e| ChainmailError::Gateway(format!("serve: {e}")))?;
    Ok(())
}
