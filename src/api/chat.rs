//! `/chat/*` handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::Response;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

use super::{respond, ApiError, AppState};
use crate::tenants::TenantRecord;

/// Body of `POST /chat/send/text`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SendTextRequest {
    /// Recipient phone number or address.
    #[serde(default)]
    pub phone: String,
    /// Message text.
    #[serde(default)]
    pub body: String,
    /// Optional caller-chosen message id.
    #[serde(default)]
    pub id: Option<String>,
}

/// `POST /chat/send/text`: send a text message.
pub async fn send_text(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantRecord>,
    body: Result<Json<SendTextRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    let sent = state
        .sessions
        .send_text(&tenant, &request.phone, &request.body, request.id)
        .await?;
    Ok(respond(json!({
        "details": "Sent",
        "timestamp": sent.timestamp,
        "id": sent.id,
    })))
}
