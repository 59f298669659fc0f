//! HTTP front end for `herald serve`.
//!
//! - `POST /push`: body is a `NotificationRequest`, response a
//!   `DispatchResponse`. Failures come back as `{"error": "..."}` with 500.
//! - `GET /health`: liveness plus the server's VAPID public key.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::notifications::{NotificationRequest, PushService};

/// Shared application state for Axum handlers.
#[derive(Debug)]
pub struct AppState {
    /// Push pipeline.
    pub service: PushService,
    /// Cancelled on shutdown; in-flight dispatches stop starting new sends.
    pub shutdown: CancellationToken,
}

/// Build the Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/push", post(handle_push))
        .route("/health", get(handle_health))
        .with_state(state)
}

/// Bind `addr` and serve until `shutdown` is cancelled.
pub async fn serve(state: Arc<AppState>, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    serve_listener(state, listener).await
}

/// Serve on an already bound listener until `state.shutdown` is cancelled.
pub async fn serve_listener(state: Arc<AppState>, listener: TcpListener) -> Result<()> {
    let local = listener.local_addr()?;
    log::info!("[Server] Listening on http://{}", local);

    let shutdown = state.shutdown.clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    log::info!("[Server] Stopped");
    Ok(())
}

/// POST /push -- dispatch to every stored subscription
async fn handle_push(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NotificationRequest>,
) -> Response {
    let cancel = state.shutdown.child_token();
    match state.service.send(request, &cancel).await {
        Ok(report) => Json(report.to_response()).into_response(),
        Err(e) => {
            log::error!("[Server] Error in push dispatch: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// GET /health -- liveness and public key
async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "publicKey": state.service.dispatcher().identity().public_key_base64url(),
    }))
}
