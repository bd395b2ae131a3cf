//! Router and request handlers.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use coachnet_gateway::{ComprehensiveHealth, StopAck};
use coachnet_kernel::{ComponentRecord, ComponentSafety, OperatorAction};
use coachnet_types::{GatewayError, PhysicalVerification, SafetyState, SendOutcome, StopRecord};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::ApiResult;
use crate::events;
use crate::state::AppState;

const DEFAULT_STOP_REASON: &str = "emergency stop requested over the api";

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/emergency-stop", post(emergency_stop))
        .route("/components", get(list_components))
        .route("/components/:name", get(get_component))
        .route("/components/:name/state", post(override_state))
        .route("/bus/send", post(send_frame))
        .route("/bus/inject", post(inject_frame))
        .route("/safety/reset", post(reset_safe_state))
        .route("/events", get(events::stream_events))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub version: String,
    pub uptime_secs: i64,
    #[serde(flatten)]
    pub health: ComprehensiveHealth,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        version: state.version.clone(),
        uptime_secs: state.uptime_secs(),
        health: state.facade.comprehensive_health().await,
    })
}

// ── Emergency stop & reset ──────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub reason: String,
}

async fn emergency_stop(
    State(state): State<AppState>,
    body: Option<Json<StopRequest>>,
) -> Json<StopAck> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let reason = match request.reason.trim() {
        "" => DEFAULT_STOP_REASON,
        reason => reason,
    };
    Json(state.facade.emergency_stop(reason).await)
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub operator: String,
    pub token: String,
    pub verification: PhysicalVerification,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub identity: String,
    /// The stop that was cleared; `null` if the interlock was already clear.
    pub cleared: Option<StopRecord>,
}

async fn reset_safe_state(
    State(state): State<AppState>,
    Json(request): Json<ResetRequest>,
) -> ApiResult<Json<ResetResponse>> {
    let authorization = state.authorize(&request.operator, &request.token, OperatorAction::ResetInterlock);
    let cleared = state
        .facade
        .reset_safe_state(&authorization, &request.verification)
        .await?;
    Ok(Json(ResetResponse {
        identity: authorization.identity,
        cleared,
    }))
}

// ── Components ──────────────────────────────────────────────────────────────

/// Registry record joined with the propagator's view of the component.
#[derive(Debug, Serialize)]
pub struct ComponentView {
    #[serde(flatten)]
    pub record: ComponentRecord,
    pub dependents: Vec<String>,
    pub state: Option<SafetyState>,
    pub consecutive_failure_count: Option<u32>,
}

fn view(state: &AppState, record: ComponentRecord) -> ComponentView {
    let safety = state
        .facade
        .propagator()
        .and_then(|handle| handle.snapshot().get(&record.name).cloned());
    ComponentView {
        dependents: state.registry.dependents(&record.name),
        state: safety.as_ref().map(|s| s.state),
        consecutive_failure_count: safety.map(|s| s.consecutive_failure_count),
        record,
    }
}

async fn list_components(State(state): State<AppState>) -> Json<Vec<ComponentView>> {
    let records = state.registry.records();
    Json(records.into_iter().map(|r| view(&state, r)).collect())
}

async fn get_component(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ComponentView>> {
    let record = state.registry.record(&name)?;
    Ok(Json(view(&state, record)))
}

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub operator: String,
    pub token: String,
    pub target: SafetyState,
}

async fn override_state(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<OverrideRequest>,
) -> ApiResult<Json<ComponentSafety>> {
    let authorization = state.authorize(&request.operator, &request.token, OperatorAction::OverrideState);
    if !authorization.authorized {
        warn!(component = %name, operator = %authorization.identity, "unauthorized state override refused");
        return Err(GatewayError::Unauthorized(authorization.identity).into());
    }
    let handle = state
        .facade
        .propagator()
        .ok_or_else(|| GatewayError::Unavailable("health propagator".to_string()))?;
    let updated = handle
        .override_state(&name, request.target, &authorization)
        .await?;
    info!(component = %name, to = %request.target, operator = %authorization.identity, "state override accepted");
    Ok(Json(updated))
}

// ── Bus ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct FrameRequest {
    pub bus: String,
    pub id: u32,
    #[serde(default)]
    pub payload: Vec<u8>,
}

async fn send_frame(
    State(state): State<AppState>,
    Json(request): Json<FrameRequest>,
) -> ApiResult<Json<SendOutcome>> {
    let outcome = state
        .facade
        .send(&request.bus, request.id, request.payload)
        .await?;
    Ok(Json(outcome))
}

async fn inject_frame(
    State(state): State<AppState>,
    Json(request): Json<FrameRequest>,
) -> ApiResult<Json<SendOutcome>> {
    let outcome = state
        .facade
        .inject(&request.bus, request.id, request.payload)
        .await?;
    Ok(Json(outcome))
}
