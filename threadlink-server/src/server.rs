//! Axum server setup and router configuration.

use crate::shutdown::shutdown_signal;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use std::net::SocketAddr;
use threadlink_core::processors::TicketServiceError;
use threadlink_core::storage::StorageStatus;
use tokio::net::TcpListener;

/// Build the main application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/tickets/{conversation_id}/refresh", post(refresh_ticket))
        .with_state(state)
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Simple health check - returns OK if the server is running.
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Ready check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    storage: StorageStatus,
    queue: QueueStatus,
}

#[derive(Serialize)]
struct QueueStatus {
    reachable: bool,
    /// Events waiting to be consumed.
    depth: Option<usize>,
}

/// Ready when the memory and durable tiers and the queue answer.
///
/// A missing or unreachable distributed tier only degrades the service.
async fn ready_check(State(state): State<AppState>) -> impl IntoResponse {
    let storage = state.storage.status().await;
    let reachable = state.queue.ping().await.is_ok();
    let depth = if reachable {
        state.queue.depth().await.ok()
    } else {
        None
    };

    let ready = storage.memory && storage.durable && reachable;
    let (code, status) = match (ready, storage.distributed) {
        (false, _) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        (true, Some(false)) => (StatusCode::OK, "degraded"),
        (true, _) => (StatusCode::OK, "ready"),
    };
    (
        code,
        Json(ReadyResponse {
            status,
            storage,
            queue: QueueStatus { reachable, depth },
        }),
    )
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Pull the remote state of one ticket into the local record.
async fn refresh_ticket(State(state): State<AppState>, Path(conversation_id): Path<String>) -> Response {
    match state.tickets.refresh_ticket(&conversation_id).await {
        Ok(ticket) => Json(ticket).into_response(),
        Err(e) => {
            let code = match &e {
                TicketServiceError::UnknownTicket(_) => StatusCode::NOT_FOUND,
                TicketServiceError::Ticketing(t) if t.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
                TicketServiceError::Ticketing(_) => StatusCode::BAD_GATEWAY,
                TicketServiceError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            if code.is_server_error() {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "Ticket refresh failed");
            }
            (code, Json(ErrorResponse { error: e.to_string() })).into_response()
        }
    }
}

/// Run the server with graceful shutdown support.
pub async fn run_server(router: Router, addr: SocketAddr) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
}
