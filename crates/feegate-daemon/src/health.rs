//! Liveness endpoint.

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::state::{DaemonState, ShutdownSignal};

/// Body of `GET /healthz`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    /// `ok`, or `shutting_down` once shutdown was requested.
    pub status: &'static str,
    /// When the daemon process started.
    pub started_at: DateTime<Utc>,
    /// Seconds since `started_at`.
    pub uptime_secs: u64,
}

async fn healthz(State(state): State<DaemonState>) -> (StatusCode, Json<HealthResponse>) {
    let (code, status) = if state.is_shutdown_requested() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
    } else {
        (StatusCode::OK, "ok")
    };
    (
        code,
        Json(HealthResponse {
            status,
            started_at: state.started_at(),
            uptime_secs: state.uptime_secs(),
        }),
    )
}

/// Routes served on the health port.
pub fn router(state: DaemonState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Serves `app` on an already bound listener until shutdown. Requests in
/// flight when shutdown arrives are allowed to finish.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown: ShutdownSignal,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "health endpoint listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.requested().await })
        .await?;
    info!("health endpoint stopped");
    Ok(())
}

/// Binds `addr` for [`serve`].
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}
