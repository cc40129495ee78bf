//! Server instance management

use axum::Router;
use http::{HeaderValue, Method};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::ApiError;
use crate::handlers::{create_router, AppState};
use crate::job::JobEnvironment;
use crate::process::{ProcessRunner, SystemProcessRunner};

/// Validation job server
///
/// Owns the shared job environment and the Axum router; each accepted WebSocket
/// connection becomes an independent session.
pub struct ValidationServer {
    /// Handler state
    state: AppState,
}

impl ValidationServer {
    /// Create a server that launches the engine with `tokio::process`
    pub fn new(config: Config) -> Result<Self, ApiError> {
        Self::with_runner(config, Arc::new(SystemProcessRunner))
    }

    /// Create a server with a custom process runner
    ///
    /// Validates the configuration, opens the work directory and removes job
    /// directories left over from earlier runs.
    pub fn with_runner(config: Config, runner: Arc<dyn ProcessRunner>) -> Result<Self, ApiError> {
        if let Err(e) = config.validate() {
            return Err(ApiError::internal(format!("Invalid config: {}", e)));
        }

        let env = JobEnvironment::from_config(&config, runner).map_err(|e| {
            error!("Failed to prepare job environment: {}", e);
            ApiError::internal(format!("Failed to prepare job environment: {}", e))
        })?;

        match env
            .store
            .sweep_stale(Duration::from_secs(config.storage.stale_job_ttl_secs))
        {
            Ok(0) => {}
            Ok(n) => info!("Removed {} stale job directories", n),
            Err(e) => warn!("Failed to sweep stale job directories: {}", e),
        }

        Ok(Self {
            state: AppState::new(env, config),
        })
    }

    /// Build the router with CORS and request tracing
    pub fn router(&self) -> Router {
        create_router()
            .layer(cors_layer(&self.state.config.server.cors_origins))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener, ApiError> {
        let addr = self
            .state
            .config
            .server
            .socket_addr()
            .map_err(ApiError::internal)?;

        TcpListener::bind(addr).await.map_err(|e| {
            error!("Failed to bind to {}: {:?}", addr, e);
            ApiError::internal(format!("Failed to bind to {}: {}", addr, e))
        })
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ApiError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            info!("Server listening on: ws://{}/ws", addr);
        }

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ApiError::internal(format!("Server error: {}", e)))
    }

    /// Bind and serve until Ctrl+C or SIGTERM
    pub async fn start(&self) -> Result<(), ApiError> {
        let listener = self.bind().await?;
        self.serve(listener, wait_for_shutdown()).await
    }
}

/// Wait for shutdown signal
///
/// Resolves on Ctrl+C or, on Unix, SIGTERM.
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix;
        match unix::signal(unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
                info!("Received TERM signal");
            }
            Err(e) => {
                error!("Failed to install TERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// CORS policy from configured origins; `"*"` allows any origin
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods([Method::GET, Method::POST]);

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(AllowOrigin::any());
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring invalid CORS origin {:?}: {}", origin, e);
                None
            }
        })
        .collect();

    layer.allow_origin(AllowOrigin::list(origins))
}
