//! HTTP routes: authentication, envelope and status mapping.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use switchboard::api::{self, AppState};

use crate::support::{harness, seed_tenant, Harness};

async fn app() -> (Router, Harness) {
    let h = harness().await;
    seed_tenant(h.store(), 7, "abc123", "", "All", false).await;
    let app = api::router(AppState::new(Arc::clone(&h.controller)));
    (app, h)
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("token", token);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request");

    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn health_needs_no_token() {
    let (app, _h) = app().await;
    let (status, body) = call(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);
}

#[tokio::test]
async fn missing_or_unknown_token_is_unauthorized() {
    let (app, _h) = app().await;

    let (status, body) = call(&app, Method::GET, "/session/status", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 401);
    assert_eq!(body["success"], false);

    let (status, _) = call(&app, Method::GET, "/webhook", Some("nope"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn token_may_come_from_query() {
    let (app, _h) = app().await;
    let (status, body) = call(&app, Method::GET, "/webhook?token=abc123", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["subscribe"], json!(["All"]));
}

#[tokio::test]
async fn webhook_set_get_and_clear() {
    let (app, h) = app().await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/webhook",
        Some("abc123"),
        Some(json!({"WebhookURL": "https://example.test/hook"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["webhook"], "https://example.test/hook");

    let (_, body) = call(&app, Method::GET, "/webhook", Some("abc123"), None).await;
    assert_eq!(body["data"]["webhook"], "https://example.test/hook");
    let row = h.store().find_by_id(7).await.expect("query").expect("row");
    assert_eq!(row.webhook_url, "https://example.test/hook");

    let (status, _) = call(&app, Method::DELETE, "/webhook", Some("abc123"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = call(&app, Method::GET, "/webhook", Some("abc123"), None).await;
    assert_eq!(body["data"]["webhook"], "");
}

#[tokio::test]
async fn invalid_webhook_url_is_bad_request() {
    let (app, _h) = app().await;
    let (status, body) = call(
        &app,
        Method::POST,
        "/webhook",
        Some("abc123"),
        Some(json!({"WebhookURL": "ftp://example.test/hook"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);
}

#[tokio::test]
async fn malformed_body_is_bad_request() {
    let (app, _h) = app().await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/chat/send/text")
        .header("token", "abc123")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn session_routes_without_session_conflict() {
    let (app, _h) = app().await;
    for (method, uri) in [
        (Method::GET, "/session/status"),
        (Method::GET, "/session/qr"),
        (Method::POST, "/session/disconnect"),
        (Method::POST, "/session/logout"),
    ] {
        let (status, body) = call(&app, method, uri, Some("abc123"), None).await;
        assert_eq!(status, StatusCode::CONFLICT, "{uri}");
        assert_eq!(body["success"], false);
    }
}

#[tokio::test]
async fn empty_pairphone_is_bad_request() {
    let (app, _h) = app().await;
    let (status, _) = call(
        &app,
        Method::POST,
        "/session/pairphone",
        Some("abc123"),
        Some(json!({"Phone": ""})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn connect_then_send_then_conflict() {
    let (app, h) = app().await;
    h.identities.authenticate_new.store(true, Ordering::SeqCst);

    let (status, body) = call(
        &app,
        Method::POST,
        "/session/connect",
        Some("abc123"),
        Some(json!({"Subscribe": ["Message", "ReadReceipt"], "Immediate": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["details"], "Connected!");
    assert_eq!(body["data"]["events"], json!(["Message", "ReadReceipt"]));
    assert_eq!(body["data"]["status"]["state"], "Connected");

    let (status, body) = call(
        &app,
        Method::POST,
        "/chat/send/text",
        Some("abc123"),
        Some(json!({"Phone": "+5491155553935", "Body": "hola", "Id": "ABC123"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["id"], "ABC123");
    assert_eq!(body["data"]["details"], "Sent");

    let (status, _) = call(&app, Method::POST, "/session/connect", Some("abc123"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, body) = call(&app, Method::GET, "/health", None, None).await;
    assert_eq!(body["sessions"], 1);
}
