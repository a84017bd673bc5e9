//! HTTP API server for the voice relay

pub mod health;
pub mod voice;
pub mod websocket;

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::providers::Providers;
use crate::{Config, Result};

/// Shared state for API handlers
pub struct ApiState {
    pub config: Arc<Config>,
    /// Backends built from the server-wide keys
    pub providers: Providers,
}

impl ApiState {
    /// State with backends for the configured keys
    #[must_use]
    pub fn new(config: Config) -> Self {
        let providers = Providers::from_config(&config);
        Self {
            config: Arc::new(config),
            providers,
        }
    }

    /// State with explicit backends
    #[must_use]
    pub fn with_providers(config: Config, providers: Providers) -> Self {
        Self {
            config: Arc::new(config),
            providers,
        }
    }
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    config: Config,
    providers: Option<Providers>,
    port: u16,
    static_dir: Option<PathBuf>,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            port: config.server.port,
            static_dir: config.server.static_dir.clone(),
            config,
            providers: None,
        }
    }

    /// Override the port
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the static files directory
    #[must_use]
    pub fn static_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.static_dir = dir;
        self
    }

    /// Use explicit backends instead of building them from keys
    #[must_use]
    pub fn providers(mut self, providers: Providers) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        let state = match self.providers {
            Some(providers) => ApiState::with_providers(self.config, providers),
            None => ApiState::new(self.config),
        };
        ApiServer {
            state: Arc::new(state),
            port: self.port,
            static_dir: self.static_dir,
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
    static_dir: Option<PathBuf>,
}

impl ApiServer {
    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .nest("/api/voice", voice::router(self.state.clone()))
            .nest("/ws", websocket::router(self.state.clone()))
            .merge(health::router(self.state.clone()));

        // Serve static files if configured
        if let Some(static_dir) = &self.static_dir {
            let index_file = static_dir.join("index.html");
            let serve_dir = ServeDir::new(static_dir).not_found_service(ServeFile::new(&index_file));

            router = router.fallback_service(serve_dir);
            tracing::info!(path = %static_dir.display(), "serving static files");
        }

        // CORS layer for browser clients served from elsewhere
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        router.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let missing = self.state.providers.missing();
        if !missing.is_empty() {
            tracing::warn!(
                ?missing,
                "some backends have no server key; clients must send their own"
            );
        }

        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, self.router())
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }
}
