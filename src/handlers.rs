//! HTTP routes

use axum::{extract::State, routing::get, Json, Router};
use std::sync::Arc;

use crate::config::Config;
use crate::error::ApiResult;
use crate::job::JobEnvironment;
use crate::websocket::{ws_handler, ConnectionRegistry};

/// State shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Job context shared by every session
    pub env: Arc<JobEnvironment>,

    /// Immutable service configuration
    pub config: Arc<Config>,

    /// Active WebSocket connections
    pub registry: ConnectionRegistry,
}

impl AppState {
    /// Create a new AppState
    pub fn new(env: JobEnvironment, config: Config) -> Self {
        Self {
            env: Arc::new(env),
            config: Arc::new(config),
            registry: ConnectionRegistry::new(),
        }
    }
}

/// GET /api/health - Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(serde_json::json!({
        "status": "ok",
        "service": "levalideur",
        "version": env!("CARGO_PKG_VERSION"),
        "active_connections": state.registry.connection_count().await,
        "status_policy": state.env.engine.status_policy,
    })))
}

/// Create router with all endpoints
///
/// The WebSocket is reachable at `/ws` and at `/` for clients that connect to the
/// bare server URL.
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/api/health", get(health_check))
}
