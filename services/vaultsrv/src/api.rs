//! HTTP API for VaultSrv
//!
//! Thin Axum handlers over the engine and the store. The sweep route exists
//! so an external at-least-once scheduler (or an operator running a drill)
//! can trigger a pass on its own cadence alongside the internal loop.

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::ProtectedMessage;
use crate::engine::{ConfirmOutcome, EscalationEngine, FastUnlockReport};
use crate::error::{Result, VaultError};
use crate::storage;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<EscalationEngine>,
}

/// Request to create a sealed message
#[derive(Debug, Deserialize)]
pub struct CreateMessageRequest {
    pub owner_id: String,
    pub content: String,
    pub owner_email: Option<String>,
    pub owner_phone: Option<String>,
    pub recipient_email: Option<String>,
    pub recipient_phone: Option<String>,
}

/// Request to start escalation
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    #[serde(default = "default_initiator")]
    pub initiator: String,
}

fn default_initiator() -> String {
    "recipient".to_string()
}

/// Query string of the confirmation link
#[derive(Debug, Deserialize)]
pub struct ConfirmParams {
    pub token: String,
}

/// Request to issue a fast-lane code
#[derive(Debug, Deserialize)]
pub struct FastLaneRequest {
    pub phone: String,
}

/// Request to redeem a fast-lane code
#[derive(Debug, Deserialize)]
pub struct FastUnlockRequest {
    pub phone: String,
    pub code: String,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Result<Json<Value>> {
    // A trivial query doubles as the storage liveness probe
    storage::phase_counts(state.engine.pool()).await?;

    Ok(Json(json!({
        "status": "healthy",
        "service": "vaultsrv",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// Message counts by phase
pub async fn get_status(State(state): State<AppState>) -> Result<Json<Value>> {
    debug!("status requested");

    let counts = storage::phase_counts(state.engine.pool()).await?;
    let by_phase: serde_json::Map<String, Value> = counts
        .into_iter()
        .map(|(phase, n)| (phase, json!(n)))
        .collect();

    Ok(Json(json!({
        "service": "vaultsrv",
        "version": env!("CARGO_PKG_VERSION"),
        "ladder_stages": state.engine.policy().stage_count(),
        "messages_by_phase": by_phase,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// Create a sealed message in IDLE
pub async fn create_message(
    State(state): State<AppState>,
    Json(request): Json<CreateMessageRequest>,
) -> Result<Json<Value>> {
    if request.content.is_empty() {
        return Err(VaultError::InvalidInput("empty content".to_string()));
    }

    let mut msg = ProtectedMessage::new(request.owner_id, request.content);
    msg.owner_email = request.owner_email;
    msg.owner_phone = request.owner_phone;
    msg.recipient_email = request.recipient_email;
    msg.recipient_phone = request.recipient_phone;

    storage::insert_message(state.engine.pool(), &msg).await?;
    info!("message {} created for owner {}", msg.id, msg.owner_id);

    Ok(Json(json!({
        "id": msg.id,
        "phase": msg.phase,
        "created_at": msg.created_at
    })))
}

/// Message metadata; the sealed content appears only once disclosed
pub async fn get_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let id = parse_id(&id)?;
    let msg = storage::get_message(state.engine.pool(), &id)
        .await?
        .ok_or_else(|| VaultError::NotFound(id.to_string()))?;

    let mut body = json!(msg);
    if msg.disclosed {
        body["content"] = json!(msg.content);
    }
    Ok(Json(body))
}

/// Begin the escalation ladder
pub async fn start_escalation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<StartRequest>,
) -> Result<Json<Value>> {
    let id = parse_id(&id)?;
    let outcome = state.engine.start(&id, &request.initiator).await?;

    Ok(Json(json!({
        "phase": outcome.phase,
        "advance_count": outcome.advance_count,
        "summary": outcome.summary
    })))
}

/// Run one sweep pass now
pub async fn run_sweep(State(state): State<AppState>) -> Result<Json<Value>> {
    let report = state.engine.sweep().await?;

    Ok(Json(json!({
        "advanced": report.advanced,
        "disclosed": report.disclosed,
        "failures": report.failures
    })))
}

/// Redeem a survival token from a confirmation link
pub async fn confirm_presence(
    State(state): State<AppState>,
    Query(params): Query<ConfirmParams>,
) -> Result<Json<Value>> {
    let report = state.engine.confirm_presence(&params.token).await?;

    let outcome = match report.outcome {
        ConfirmOutcome::Confirmed => "confirmed",
        ConfirmOutcome::AlreadyResolved => "already-resolved",
    };
    Ok(Json(json!({
        "outcome": outcome,
        "failures": report.failures
    })))
}

/// Issue a fast-lane code to the owner's registered phone
pub async fn request_fast_lane(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<FastLaneRequest>,
) -> Result<Json<Value>> {
    let id = parse_id(&id)?;
    let issued = state.engine.request_fast_lane(&id, &request.phone).await?;

    Ok(Json(json!({
        "message": "code sent",
        "expires_at": issued.expires_at,
        "failures": issued.failures
    })))
}

/// Redeem a fast-lane code for immediate disclosure
pub async fn fast_unlock(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<FastUnlockRequest>,
) -> Result<Json<Value>> {
    let id = parse_id(&id)?;
    let report = state
        .engine
        .fast_unlock(&id, &request.phone, &request.code)
        .await?;

    let body = match report {
        FastUnlockReport::Unlocked { content, failures } => json!({
            "outcome": "unlocked",
            "content": content,
            "failures": failures
        }),
        FastUnlockReport::AlreadyResolved { phase, content } => json!({
            "outcome": "already-resolved",
            "phase": phase,
            "content": content
        }),
    };
    Ok(Json(body))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| VaultError::InvalidInput("invalid message id".to_string()))
}

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Service status
        .route("/api/v1/status", get(get_status))
        // Message lifecycle
        .route("/api/v1/messages", post(create_message))
        .route("/api/v1/messages/{id}", get(get_message))
        // Engine entry points
        .route("/api/v1/messages/{id}/escalation/start", post(start_escalation))
        .route("/api/v1/sweep", post(run_sweep))
        .route("/api/v1/presence/confirm", get(confirm_presence))
        .route("/api/v1/messages/{id}/fast-lane", post(request_fast_lane))
        .route("/api/v1/messages/{id}/fast-unlock", post(fast_unlock))
        .with_state(state)
}
