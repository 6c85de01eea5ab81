//! Read-only web API for dashboards.
//!
//! Every route is a pure read of the store; it is safe to poll them at
//! arbitrary cadence.

mod handlers;

pub use handlers::*;

use crate::config::Config;
use crate::db::Store;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
}

/// Query API server.
pub struct Server {
    port: u16,
    state: AppState,
}

impl Server {
    pub fn new(config: &Config, store: Arc<Store>) -> Self {
        Self {
            port: config.http_port,
            state: AppState { store },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/api/status", get(handlers::handle_status))
            .route("/api/hosts", get(handlers::handle_hosts))
            .route("/api/results", get(handlers::handle_results))
            .route("/api/statistics", get(handlers::handle_statistics))
            .route("/api/outages", get(handlers::handle_outages))
            .route(
                "/api/outages/statistics",
                get(handlers::handle_outage_statistics),
            )
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
