//! `/webhook` handlers: read, set and clear the tenant's callback URL.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::Response;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{respond, ApiError, AppState};
use crate::tenants::TenantRecord;

/// Body of `POST /webhook`.
#[derive(Debug, Deserialize)]
pub struct SetWebhookRequest {
    /// Callback URL.
    #[serde(rename = "WebhookURL", alias = "webhook_url", default)]
    pub webhook_url: String,
}

/// `GET /webhook`: current URL and subscriptions.
pub async fn get_webhook(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantRecord>,
) -> Result<Response, ApiError> {
    // The extension snapshot may predate a concurrent update; re-read.
    let current = state
        .sessions
        .cache()
        .authenticate(&tenant.token)
        .await?
        .unwrap_or(tenant);
    Ok(respond(json!({
        "webhook": current.webhook_url,
        "subscribe": current.events,
    })))
}

/// `POST /webhook`: set the callback URL.
pub async fn set_webhook(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantRecord>,
    body: Result<Json<SetWebhookRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    let url = validate_webhook_url(&request.webhook_url)?;
    state.sessions.cache().set_webhook(&tenant, &url).await?;
    info!(tenant_id = tenant.id, url = %url, "webhook updated");
    Ok(respond(json!({ "webhook": url })))
}

/// `DELETE /webhook`: clear the callback URL.
pub async fn delete_webhook(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantRecord>,
) -> Result<Response, ApiError> {
    state.sessions.cache().set_webhook(&tenant, "").await?;
    info!(tenant_id = tenant.id, "webhook removed");
    Ok(respond(json!({ "details": "Webhook removed" })))
}

/// Accept absolute `http`/`https` URLs only.
///
/// # Errors
///
/// Returns [`ApiError::BadRequest`] for empty, unparsable or non-HTTP URLs.
pub fn validate_webhook_url(raw: &str) -> Result<String, ApiError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ApiError::BadRequest("missing WebhookURL in payload".to_owned()));
    }
    let parsed = url::Url::parse(raw)
        .map_err(|e| ApiError::BadRequest(format!("invalid WebhookURL: {e}")))?;
    match parsed.scheme() {
        "http" | "https" if parsed.has_host() => Ok(raw.to_owned()),
        _ => Err(ApiError::BadRequest(
            "WebhookURL must be an http(s) URL".to_owned(),
        )),
    }
}
