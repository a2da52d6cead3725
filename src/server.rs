//! HTTP surface for the event loop.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness of the operator itself (returns version) |
//! | `GET`  | `/status` | Latest [`StatusReport`] |
//! | `POST` | `/events` | Queue one [`Event`] for reconciliation |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "unavailable", "message": "event loop has stopped" } }
//! ```
//!
//! Malformed event bodies are rejected by axum's `Json` extractor before they
//! reach the queue.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::StatusReport;
use crate::events::Event;
use crate::runtime::EventHandle;

pub fn router(handle: EventHandle) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/events", post(handle_event))
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

/// Serve the router on `bind` until the process is terminated.
pub async fn run_server(bind: &str, handle: EventHandle) -> anyhow::Result<()> {
    let app = router(handle);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind, "event server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn unavailable(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code: "unavailable".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /status ============

async fn handle_status(State(handle): State<EventHandle>) -> Json<StatusReport> {
    Json(handle.status.borrow().clone())
}

// ============ POST /events ============

#[derive(Serialize)]
struct QueuedResponse {
    queued: &'static str,
}

async fn handle_event(
    State(handle): State<EventHandle>,
    Json(event): Json<Event>,
) -> Result<(StatusCode, Json<QueuedResponse>), AppError> {
    let name = event.name();
    handle
        .events
        .send(event)
        .await
        .map_err(|_| unavailable("event loop has stopped"))?;
    Ok((StatusCode::ACCEPTED, Json(QueuedResponse { queued: name })))
}
