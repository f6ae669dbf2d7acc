//! Liveness and readiness endpoints
//!
//! - `GET /health`: always `ok` while the process serves requests
//! - `GET /ready`: `ok` once follower caches are warm and controllers started,
//!   503 before that and after shutdown begins

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mirror_controller::Registry;

/// Something that can report readiness
pub trait Readiness: Send + Sync {
    /// Whether the process should receive traffic
    fn is_ready(&self) -> bool;
}

impl Readiness for Registry {
    fn is_ready(&self) -> bool {
        Registry::is_ready(self)
    }
}

/// Build the health router
pub fn health_routes(readiness: Arc<dyn Readiness>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/ready", get(ready))
        .with_state(readiness)
}

async fn ready(State(readiness): State<Arc<dyn Readiness>>) -> (StatusCode, &'static str) {
    if readiness.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Serve the health endpoints on `port` until `token` fires
pub async fn serve(port: u16, readiness: Arc<dyn Readiness>, token: CancellationToken) {
    let app = health_routes(readiness);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => {
            info!(addr = %addr, "health server started");
            l
        }
        Err(e) => {
            error!(error = %e, port, "failed to bind health port");
            return;
        }
    };

    let shutdown = async move { token.cancelled().await };
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!(error = %e, "health server error");
    }
}
