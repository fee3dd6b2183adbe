//! Web server setup and routing

use anyhow::{Context, Result};
use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api;
use crate::state::AppState;

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/devices", get(api::list_devices))
        .route("/api/devices/{key}", get(api::get_device))
        .route("/api/devices/{key}/refresh", post(api::refresh_device))
        .route("/api/devices/{key}/name", put(api::set_name))
        .route("/api/devices/{key}/controlled-by", put(api::set_controlled_by))
        .route("/api/devices/{key}/install-key", post(api::install_key))
        .route("/api/credentials/{key}", put(api::cache_credential))
        .route("/api/verify/{ip}", post(api::verify_ip))
        .route("/api/topology", get(api::get_topology))
        .route("/api/reload", post(api::reload_config))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server until it fails
pub async fn run(state: Arc<AppState>, bind: &str) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!(address = %bind, "Starting web server");
    axum::serve(listener, app).await?;
    Ok(())
}
