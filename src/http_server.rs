/// HTTP Server Module
///
/// Provides health and knowledge base endpoints for hosting platforms and
/// uptime checks.
use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use chrono::Utc;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::vector_store::VectorStoreManager;

#[derive(Clone)]
pub struct AppState {
    pub vector_store: Arc<VectorStoreManager>,
}

/// Create and configure the HTTP server router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/knowledge-stats", get(knowledge_stats_endpoint))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(serde_json::json!({
        "status": "ok",
        "service": "film_series_bot",
        "timestamp": Utc::now().to_rfc3339()
    })))
}

/// Get knowledge base statistics endpoint
async fn knowledge_stats_endpoint(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let chunks = state.vector_store.count().await.map_err(|e| {
        log::error!("Failed to read knowledge base statistics: {}", e);
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(Json(serde_json::json!({
        "backend": state.vector_store.backend(),
        "chunks": chunks
    })))
}

/// Start the HTTP server
pub async fn start_server(state: AppState, port: u16) -> Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .context("Failed to bind HTTP server")?;

    log::info!("HTTP server listening on port {}", port);

    axum::serve(listener, app)
        .await
        .context("HTTP server error")?;

    Ok(())
}
