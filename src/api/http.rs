//! HTTP API Server
//!
//! Health and status endpoints for a running data writer.

use std::sync::Arc;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::writer::DataWriter;

/// Shared application state
pub struct AppState {
    pub writer: Arc<DataWriter>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, writer: Arc<DataWriter>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { writer }),
        }
    }

    /// Create the router
    fn create_router(state: Arc<AppState>, cors: bool) -> Router {
        let router = Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        if cors {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state), self.config.cors_enabled);

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

/// Health response
#[derive(Debug, Serialize)]
struct HealthResponse {
    healthy: bool,
    node_id: String,
    state: &'static str,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let writer = &state.writer;
    let healthy = writer.store().health_check().await.unwrap_or(false);
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthResponse {
            healthy,
            node_id: writer.node_id().to_string(),
            state: writer.state().as_str(),
        }),
    )
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.writer.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => {
            tracing::warn!("Status query failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse { error: e.to_string() }),
            )
                .into_response()
        }
    }
}
