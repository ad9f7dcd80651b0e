//! Tenant token authentication.
//!
//! The token is read from the `token` header, or from a `?token=` query
//! parameter when the header is absent, and resolved through the tenant
//! cache. The resolved [`TenantRecord`] is attached as a request extension.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::{ApiError, AppState};
use crate::tenants::TenantRecord;

/// Axum middleware that rejects requests without a known tenant token.
///
/// # Error responses
///
/// - `401 Unauthorized`: token missing or unknown
/// - `500 Internal Server Error`: tenant lookup failed
pub async fn require_token(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = token_from_request(&request) else {
        return ApiError::Unauthorized.into_response();
    };

    let tenant: TenantRecord = match state.sessions.cache().authenticate(&token).await {
        Ok(Some(tenant)) => tenant,
        Ok(None) => return ApiError::Unauthorized.into_response(),
        Err(e) => return ApiError::Tenant(e).into_response(),
    };

    request.extensions_mut().insert(tenant);
    next.run(request).await
}

fn token_from_request(request: &Request) -> Option<String> {
    let header = request
        .headers()
        .get("token")
        .and_then(|v| v.to_str().ok())
        .filter(|t| !t.is_empty());
    if let Some(token) = header {
        return Some(token.to_owned());
    }

    request.uri().query().and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.into_owned())
            .filter(|t| !t.is_empty())
    })
}
