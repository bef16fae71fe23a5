//! The HTTP control surface: status, run admission, pause gates, logs and
//! artifacts.
//!
//! The operator dashboard polls `/api/negotiation/status` and `/api/logs`
//! rather than holding a socket open, so every handler here answers from
//! shared state without touching the browser. Rejections carry real status
//! codes (409 while a run holds the slot, 400 for bad input, 404 for
//! unknown names) with an [`ErrorResponse`] body.

use crate::core::app_state::AppState;
use crate::core::types::{
    ErrorResponse, GateStatus, GenerateOpenerRequest, GotoProductRequest, NegotiationState,
    NegotiationStatus, StartRequest, StartResponse, SystemStatus,
};
use crate::negotiate::artifacts::ArtifactStore;
use crate::negotiate::gates::GateName;
use crate::negotiate::machine::{self, AdmissionError};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(system_status))
        .route("/api/ai-status", get(ai_status))
        .route("/api/negotiate/start", post(negotiation_start))
        .route("/api/negotiate/stop", post(negotiation_stop))
        .route("/api/negotiation/status", get(negotiation_status))
        .route("/api/gates", get(gates_snapshot))
        .route("/api/gate/{name}/open", post(gate_open))
        .route("/api/gate/{name}/reset", post(gate_reset))
        .route("/api/logs", get(logs_since))
        .route("/api/artifacts", get(artifacts_index))
        .route("/api/artifacts/{session_id}", get(artifacts_detail))
        .route("/api/generate-opener", post(opener_preview))
        .route("/api/session/login-only", post(session_login_only))
        .route("/api/session/goto-product", post(session_goto_product))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "cortex-parley",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn system_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let ai = state.reply_gen.status();
    let active = if state.is_run_active().await { 1 } else { 0 };
    Json(SystemStatus {
        status: "ok".to_string(),
        server: "cortex-parley".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        has_ai_api: ai.available,
        ai_model: ai.model,
        active_sessions: active,
    })
}

async fn ai_status(State(state): State<AppState>) -> Json<Value> {
    let ai = state.reply_gen.status();
    let message = if ai.available {
        format!("AI mode: {} via Gemini", ai.model)
    } else {
        "AI mode: template replies (set PARLEY_AI_API_KEY for Gemini)".to_string()
    };
    Json(json!({
        "ai_enabled": ai.available,
        "using_mock": ai.mock,
        "model_name": ai.model,
        "message": message,
    }))
}

async fn negotiation_start(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Result<Json<StartResponse>, ApiError> {
    let id = machine::start_negotiation(&state, req)
        .await
        .map_err(admission_error)?;
    Ok(Json(StartResponse {
        ok: true,
        session_id: Some(id),
        message: "negotiation started — follow /api/logs for progress".to_string(),
        current_state: Some(NegotiationState::EnsureLogin),
    }))
}

/// Idempotent: asking an idle server to stop is not an error.
async fn negotiation_stop(State(state): State<AppState>) -> Json<Value> {
    match machine::stop_active(&state).await {
        Some(id) => Json(json!({ "ok": true, "message": format!("stop requested for {id}") })),
        None => Json(json!({ "ok": true, "message": "no active run" })),
    }
}

async fn negotiation_status(State(state): State<AppState>) -> Json<NegotiationStatus> {
    let Some(session) = state.current_session().await else {
        return Json(NegotiationStatus::idle());
    };
    let active = state.is_run_active().await;
    let snap = session.read().await.snapshot();
    Json(NegotiationStatus::from_snapshot(active, &snap))
}

async fn gates_snapshot(State(state): State<AppState>) -> Json<Vec<GateStatus>> {
    Json(state.gates.snapshot())
}

async fn gate_open(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let gate = parse_gate(&name)?;
    state.gates.open(gate);
    Ok(Json(json!({ "ok": true, "gate": gate.as_str(), "open": true })))
}

async fn gate_reset(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let gate = parse_gate(&name)?;
    state.gates.reset(gate);
    Ok(Json(json!({ "ok": true, "gate": gate.as_str(), "open": false })))
}

fn parse_gate(name: &str) -> Result<GateName, ApiError> {
    GateName::parse(name).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(format!("unknown gate '{name}'"))),
        )
    })
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    /// Highest sequence number the client has already seen.
    #[serde(default)]
    after: u64,
    limit: Option<usize>,
}

async fn logs_since(
    State(state): State<AppState>,
    Query(q): Query<LogsQuery>,
) -> Json<Value> {
    let records = state.log_hub.since(q.after, q.limit.unwrap_or(200));
    Json(json!({
        "records": records,
        "last_seq": state.log_hub.last_seq(),
    }))
}

async fn artifacts_index(State(state): State<AppState>) -> Json<Value> {
    let store = ArtifactStore::new(&state.data_dir());
    Json(json!({ "sessions": store.list() }))
}

async fn artifacts_detail(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let store = ArtifactStore::new(&state.data_dir());
    match store.load_session(&session_id) {
        Some(artifacts) => Ok(Json(json!(artifacts))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(format!(
                "no artifacts for session '{session_id}'"
            ))),
        )),
    }
}

/// Previews the opening message without starting a run.
async fn opener_preview(
    State(state): State<AppState>,
    Json(req): Json<GenerateOpenerRequest>,
) -> Json<Value> {
    let locale = req
        .locale
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| state.config.resolve_locale());
    let text = state
        .reply_gen
        .opening_message(&req.goals, req.product_url.as_deref(), &locale)
        .await;
    let ai = state.reply_gen.status();
    Json(json!({ "ok": true, "text": text, "is_mock": ai.mock }))
}

async fn session_login_only(
    State(state): State<AppState>,
) -> Result<Json<StartResponse>, ApiError> {
    let id = machine::start_login_only(&state)
        .await
        .map_err(admission_error)?;
    Ok(Json(StartResponse {
        ok: true,
        session_id: Some(id),
        message: "login-only session started — a browser window is opening".to_string(),
        current_state: Some(NegotiationState::EnsureLogin),
    }))
}

async fn session_goto_product(
    State(state): State<AppState>,
    Json(req): Json<GotoProductRequest>,
) -> Result<Json<Value>, ApiError> {
    let url = machine::goto_product(&state, req)
        .await
        .map_err(admission_error)?;
    Ok(Json(json!({
        "ok": true,
        "product_url": url,
        "current_state": NegotiationState::AtProduct,
    })))
}

fn admission_error(err: AdmissionError) -> ApiError {
    let code = match &err {
        AdmissionError::Invalid(_) => StatusCode::BAD_REQUEST,
        AdmissionError::Navigation(_) => StatusCode::BAD_GATEWAY,
        AdmissionError::AlreadyRunning
        | AdmissionError::NoHeldBrowser
        | AdmissionError::NotReady(_) => StatusCode::CONFLICT,
    };
    (code, Json(ErrorResponse::new(err.to_string())))
}
