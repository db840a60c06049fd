//! Local operator status API (ambient ops surface, §9.3), adapted from the
//! daemon's axum status router: a read-only view of the current round for
//! whichever role this process is running.

use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};

use crate::daemon::DaemonManager;

#[derive(Clone, Default)]
pub struct ApiState {
    pub role: String,
    pub round_id: Option<String>,
    pub state: String,
    pub last_error: Option<String>,
}

pub type SharedApiState = Arc<RwLock<ApiState>>;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct StatusResponse {
    role: String,
    round_id: Option<String>,
    state: String,
    last_error: Option<String>,
    daemon_running: bool,
    daemon_pid: Option<u32>,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn get_status(axum::extract::State(state): axum::extract::State<SharedApiState>) -> Json<StatusResponse> {
    let snapshot = state.read().await.clone();
    let (running, pid) = DaemonManager::status(&snapshot.role);
    Json(StatusResponse {
        role: snapshot.role,
        round_id: snapshot.round_id,
        state: snapshot.state,
        last_error: snapshot.last_error,
        daemon_running: running,
        daemon_pid: pid,
    })
}

pub async fn run_api_server(
    bind_addr: &str,
    state: SharedApiState,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = Router::new()
        .route("/health", get(health))
        .route("/api/status", get(get_status))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(bind_addr, "status API listening");
    axum::serve(listener, app).await?;
    Ok(())
}
