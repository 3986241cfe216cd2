//! Web layer module
//!
//! Thin axum handlers over [`StreamManager`]. Handlers parse the request,
//! delegate to the manager and map [`crate::errors::AppError`] onto HTTP
//! status codes through [`responses`].

use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{config::Config, database::Database, storage::MediaStorage, streaming::StreamManager};

pub mod api;
pub mod responses;

pub use responses::ApiResponse;

/// Web server configuration and setup
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(
        config: Config,
        database: Database,
        manager: StreamManager,
        storage: MediaStorage,
    ) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.web.host, config.web.port).parse()?;

        let app = create_router(AppState {
            database,
            config,
            manager,
            storage,
        });

        Ok(Self { app, addr })
    }

    /// Serve until `shutdown` resolves, then let in-flight requests finish.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub database: Database,
    pub config: Config,
    pub manager: StreamManager,
    pub storage: MediaStorage,
}

/// Build the router with all routes and middleware
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.config.web.max_upload_bytes;

    Router::new()
        .route("/health", get(api::health_check))
        .nest("/api/v1", api_v1_routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_v1_routes() -> Router<AppState> {
    Router::new()
        // Job lifecycle
        .route("/streams/start", post(api::start_stream))
        .route("/streams/stop", post(api::stop_stream))
        .route("/streams/:stream_key/cancel-schedule", post(api::cancel_schedule))
        .route("/streams/:stream_key/status", get(api::stream_status))
        // Registry views
        .route("/streams/active", get(api::list_active_streams))
        .route("/streams/scheduled", get(api::list_scheduled_streams))
        // History
        .route("/streams", get(api::list_streams))
        .route("/streams/history/:id", delete(api::delete_stream_record))
}
