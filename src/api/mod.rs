//! HTTP surface.
//!
//! Every route except [`health`] requires a tenant token, checked by
//! [`auth::require_token`]. Responses use the envelope
//! `{"code": <status>, "success": <bool>, "data" | "error": ...}`.

pub mod auth;
pub mod chat;
pub mod session;
pub mod webhook;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::session::{SessionController, SessionError};
use crate::tenants::TenantError;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Session controller (and through it the tenant cache).
    pub sessions: Arc<SessionController>,
    /// Process start, for uptime reporting.
    pub started: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    /// Wrap a controller.
    pub fn new(sessions: Arc<SessionController>) -> Self {
        Self {
            sessions,
            started: Instant::now(),
        }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/health", get(health));

    let authed_routes = Router::new()
        .route("/session/connect", post(session::connect))
        .route("/session/disconnect", post(session::disconnect))
        .route("/session/logout", post(session::logout))
        .route("/session/status", get(session::status))
        .route("/session/qr", get(session::qr))
        .route("/session/pairphone", post(session::pair_phone))
        .route(
            "/webhook",
            get(webhook::get_webhook)
                .post(webhook::set_webhook)
                .delete(webhook::delete_webhook),
        )
        .route("/chat/send/text", post(chat::send_text))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_token,
        ));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /health`: liveness probe, no authentication.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.sessions.session_count().await,
        "uptime_secs": state.started.elapsed().as_secs(),
    }))
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Successful enveloped response.
pub fn respond<T: Serialize>(data: T) -> Response {
    let status = StatusCode::OK;
    (
        status,
        Json(json!({ "code": status.as_u16(), "success": true, "data": data })),
    )
        .into_response()
}

/// Errors surfaced to HTTP callers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or unknown token.
    #[error("unauthorized")]
    Unauthorized,

    /// Body could not be decoded or failed validation.
    #[error("{0}")]
    BadRequest(String),

    /// Session operation failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Tenant store failure.
    #[error(transparent)]
    Tenant(#[from] TenantError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(format!("could not decode payload: {}", rejection.body_text()))
    }
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) | Self::Session(SessionError::Validation(_)) => {
                StatusCode::BAD_REQUEST
            }
            Self::Session(SessionError::State(_)) => StatusCode::CONFLICT,
            Self::Session(SessionError::Downstream(_)) => StatusCode::BAD_GATEWAY,
            Self::Session(SessionError::Persistence(_)) | Self::Tenant(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (
            status,
            Json(json!({
                "code": status.as_u16(),
                "success": false,
                "error": self.to_string(),
            })),
        )
            .into_response()
    }
}
