//! Web server setup and routing

use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/accessories", get(api::list_accessories))
        .route("/api/accessories/{id}", get(api::get_accessory))
        .route(
            "/api/accessories/{id}/characteristics/{name}",
            get(api::read_characteristic).put(api::write_characteristic),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve the REST API until the listener fails
pub async fn run(state: Arc<AppState>, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %bind, "Starting API server");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
