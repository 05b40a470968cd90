//! HTTP server implementation using Axum.

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::info;
use zonebot_config::Config;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    /// Identifier this instance reports in ping and release responses.
    pub self_bot_id: String,
    /// Secret inbound release calls must present. None disables the
    /// release endpoint entirely (every call is rejected).
    pub secret_key: Option<String>,
    pub start_time: Instant,
}

impl AppState {
    pub fn from_config(config: &Config) -> Self {
        Self {
            self_bot_id: config.release.self_bot_id.clone(),
            secret_key: config.release.secret_key.clone(),
            start_time: Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);
    Router::new()
        .route("/", get(super::routes::status_page))
        .route("/ping", get(super::routes::ping))
        .route("/api/release-user", post(super::routes::release_user))
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Bind and serve until the process exits.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let router = build_router(state);
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}
