//! `/session/*` handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::Response;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

use super::{respond, ApiError, AppState};
use crate::tenants::{parse_subscriptions, TenantRecord};

/// Body of `POST /session/connect`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectRequest {
    /// Event kinds to forward; empty means all.
    #[serde(default)]
    pub subscribe: Vec<String>,
    /// Return without waiting for the session to come up.
    #[serde(default)]
    pub immediate: bool,
}

/// Body of `POST /session/pairphone`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PairPhoneRequest {
    /// Phone number in international format.
    #[serde(default)]
    pub phone: String,
}

/// `POST /session/connect`: persist subscriptions and start the session.
pub async fn connect(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantRecord>,
    body: Option<Json<ConnectRequest>>,
) -> Result<Response, ApiError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let status = state
        .sessions
        .connect(&tenant, &request.subscribe, request.immediate)
        .await?;
    let events = parse_subscriptions(request.subscribe.iter().map(String::as_str));
    Ok(respond(json!({
        "details": "Connected!",
        "events": events,
        "jid": tenant.network_identity,
        "webhook": tenant.webhook_url,
        "status": status,
    })))
}

/// `POST /session/disconnect`: tear the session down, keeping the pairing.
pub async fn disconnect(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantRecord>,
) -> Result<Response, ApiError> {
    state.sessions.disconnect(&tenant).await?;
    Ok(respond(json!({ "details": "Disconnected" })))
}

/// `POST /session/logout`: unlink the device and tear the session down.
pub async fn logout(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantRecord>,
) -> Result<Response, ApiError> {
    state.sessions.logout(&tenant).await?;
    Ok(respond(json!({ "details": "Logged out" })))
}

/// `GET /session/status`.
pub async fn status(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantRecord>,
) -> Result<Response, ApiError> {
    let status = state.sessions.status(&tenant).await?;
    Ok(respond(status))
}

/// `GET /session/qr`: current pairing QR code as a PNG data URL.
pub async fn qr(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantRecord>,
) -> Result<Response, ApiError> {
    let code = state.sessions.qr(&tenant).await?;
    Ok(respond(json!({ "qrcode": code })))
}

/// `POST /session/pairphone`: request a phone-linking code.
pub async fn pair_phone(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantRecord>,
    body: Result<Json<PairPhoneRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    let code = state.sessions.pair_phone(&tenant, &request.phone).await?;
    Ok(respond(json!({ "linking_code": code })))
}
