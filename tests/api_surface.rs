//! Control-API surface checks via in-process requests.
//!
//! Every test drives the real router with `tower::ServiceExt::oneshot`, so
//! routing, extractors, status codes and JSON shapes are all exercised
//! without binding a port. Only browserless paths run here — anything that
//! would launch Chrome is covered by the scripted-machine scenarios.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use cortex_parley::ai::MockGenerator;
use cortex_parley::api::build_router;
use cortex_parley::config::ParleyConfig;
use cortex_parley::AppState;

fn test_state(tmp: &TempDir) -> AppState {
    let config = ParleyConfig {
        data_dir: Some(tmp.path().display().to_string()),
        default_locale: Some("en".to_string()),
        ..ParleyConfig::default()
    };
    // Forced mock keeps the AI endpoints deterministic even when the test
    // environment carries a real API key.
    AppState::new(reqwest::Client::new(), config)
        .with_reply_gen(Arc::new(MockGenerator::new("en".to_string())))
}

async fn read_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    (status, read_json(response).await)
}

async fn post(app: &Router, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(v) => Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    (status, read_json(response).await)
}

#[tokio::test]
async fn health_reports_the_service() {
    let tmp = TempDir::new().unwrap();
    let app = build_router(test_state(&tmp));

    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "cortex-parley");
}

#[tokio::test]
async fn system_status_shows_an_idle_server() {
    let tmp = TempDir::new().unwrap();
    let app = build_router(test_state(&tmp));

    let (status, body) = get(&app, "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["server"], "cortex-parley");
    assert_eq!(body["active_sessions"], 0);
    assert_eq!(body["has_ai_api"], false);
}

#[tokio::test]
async fn ai_status_reports_template_mode_without_a_key() {
    let tmp = TempDir::new().unwrap();
    let app = build_router(test_state(&tmp));

    let (status, body) = get(&app, "/api/ai-status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ai_enabled"], false);
    assert_eq!(body["using_mock"], true);
    assert!(body["message"].as_str().unwrap().contains("template replies"));
}

#[tokio::test]
async fn negotiation_status_starts_idle() {
    let tmp = TempDir::new().unwrap();
    let app = build_router(test_state(&tmp));

    let (status, body) = get(&app, "/api/negotiation/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], false);
    // Idle status carries no session fields at all.
    assert!(body.get("session_id").is_none());
    assert!(body.get("current_state").is_none());
}

#[tokio::test]
async fn gate_lifecycle_over_http() {
    let tmp = TempDir::new().unwrap();
    let app = build_router(test_state(&tmp));

    let (status, body) = get(&app, "/api/gates").await;
    assert_eq!(status, StatusCode::OK);
    let gates = body.as_array().unwrap();
    assert_eq!(gates.len(), 3);
    assert_eq!(gates[0]["name"], "after_login");
    assert_eq!(gates[1]["name"], "product_and_chat");
    assert_eq!(gates[2]["name"], "after_send");
    assert!(gates.iter().all(|g| g["open"] == false));

    let (status, body) = post(&app, "/api/gate/after_send/open", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["open"], true);

    let (_, body) = get(&app, "/api/gates").await;
    let gates = body.as_array().unwrap();
    assert_eq!(gates[2]["open"], true);
    assert!(gates[2]["opened_at"].is_string());

    let (status, body) = post(&app, "/api/gate/after_send/reset", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["open"], false);

    let (_, body) = get(&app, "/api/gates").await;
    assert_eq!(body.as_array().unwrap()[2]["open"], false);
}

#[tokio::test]
async fn unknown_gate_is_a_404() {
    let tmp = TempDir::new().unwrap();
    let app = build_router(test_state(&tmp));

    let (status, body) = post(&app, "/api/gate/before_breakfast/open", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("unknown gate"));
}

#[tokio::test]
async fn start_rejects_a_foreign_product_url() {
    let tmp = TempDir::new().unwrap();
    let app = build_router(test_state(&tmp));

    let (status, body) = post(
        &app,
        "/api/negotiate/start",
        Some(json!({ "product_url": "https://www.alibaba.com/offer/609815753222.html" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("product_url"));

    // The rejection must not have admitted anything.
    let (_, body) = get(&app, "/api/negotiation/status").await;
    assert_eq!(body["active"], false);
}

#[tokio::test]
async fn start_rejects_a_zero_turn_budget() {
    let tmp = TempDir::new().unwrap();
    let app = build_router(test_state(&tmp));

    let (status, body) = post(
        &app,
        "/api/negotiate/start",
        Some(json!({ "product_url": "609815753222", "max_turns": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("max_turns"));
}

#[tokio::test]
async fn start_rejects_an_absurd_reply_wait() {
    let tmp = TempDir::new().unwrap();
    let app = build_router(test_state(&tmp));

    for bad in [0u64, u64::MAX] {
        let (status, body) = post(
            &app,
            "/api/negotiate/start",
            Some(json!({ "product_url": "609815753222", "wait_timeout_s": bad })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("wait_timeout_s"));
    }

    let (_, body) = get(&app, "/api/negotiation/status").await;
    assert_eq!(body["active"], false);
}

#[tokio::test]
async fn goto_product_without_a_held_browser_conflicts() {
    let tmp = TempDir::new().unwrap();
    let app = build_router(test_state(&tmp));

    let (status, body) = post(
        &app,
        "/api/session/goto-product",
        Some(json!({ "product_url": "609815753222" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("no login-only session"));
}

#[tokio::test]
async fn stop_is_idempotent_when_idle() {
    let tmp = TempDir::new().unwrap();
    let app = build_router(test_state(&tmp));

    let (status, body) = post(&app, "/api/negotiate/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["message"], "no active run");
}

#[tokio::test]
async fn logs_endpoint_pages_by_sequence() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    state.log_hub.info("test", "first");
    state.log_hub.warn("test", "second");
    state.log_hub.info("test", "third");
    let app = build_router(state);

    let (status, body) = get(&app, "/api/logs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["records"].as_array().unwrap().len(), 3);
    assert_eq!(body["last_seq"], 3);

    let (_, body) = get(&app, "/api/logs?after=2").await;
    let records = body["records"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["seq"], 3);
    assert_eq!(records[0]["message"], "third");

    let (_, body) = get(&app, "/api/logs?after=0&limit=2").await;
    assert_eq!(body["records"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn artifacts_are_empty_on_a_fresh_data_dir() {
    let tmp = TempDir::new().unwrap();
    let app = build_router(test_state(&tmp));

    let (status, body) = get(&app, "/api/artifacts").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessions"].as_array().unwrap().len(), 0);

    let (status, body) = get(&app, "/api/artifacts/session_nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("session_nope"));
}

#[tokio::test]
async fn opener_preview_answers_without_a_run() {
    let tmp = TempDir::new().unwrap();
    let app = build_router(test_state(&tmp));

    let (status, body) = post(
        &app,
        "/api/generate-opener",
        Some(json!({ "locale": "en" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["is_mock"], true);
    assert!(body["text"].as_str().unwrap().starts_with("Hello"));
}
