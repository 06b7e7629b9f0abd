use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// How the server misbehaves, if at all.
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    /// Sleep this long before binding the port.
    pub startup_delay: Duration,
    /// Never bind the port at all.
    pub never_bind: bool,
    /// Answer `/health` with 503.
    pub unhealthy: bool,
}

#[derive(Debug, Clone)]
struct AppState {
    healthy: bool,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub pid: u32,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(healthy: bool) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/echo", post(echo))
        .with_state(AppState { healthy })
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run(addr: SocketAddr, options: &ServeOptions) -> Result<()> {
    if !options.startup_delay.is_zero() {
        tracing::info!(delay = ?options.startup_delay, "delaying startup");
        tokio::time::sleep(options.startup_delay).await;
    }

    if options.never_bind {
        tracing::info!("never binding, idling until killed");
        std::future::pending::<()>().await;
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("tether-testserver listening on http://{addr}");

    axum::serve(listener, build_router(!options.unhealthy))
        .await
        .context("server error")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let pid = std::process::id();
    if state.healthy {
        (StatusCode::OK, Json(HealthResponse { status: "ok", pid }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unhealthy",
                pid,
            }),
        )
    }
}

async fn echo(body: String) -> String {
    body
}
