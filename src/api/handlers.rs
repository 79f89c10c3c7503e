use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::alerts::{AlertEngine, AlertState, EngineError};
use crate::data::{EntityKind, MonitoredEntity, StatusTick};
use crate::scheduler::Scheduler;
use crate::storage::{HistoryError, HistoryStore, UptimeSummary};
use crate::subscriptions::{
    ReactionEvent, RegistryError, RoleSync, SubscriptionOutcome, SubscriptionRegistry,
};

/// Application state shared across handlers
pub struct AppState {
    pub entities: Vec<MonitoredEntity>,
    pub history: Arc<HistoryStore>,
    pub engine: Arc<AlertEngine>,
    pub registry: Arc<SubscriptionRegistry>,
    pub scheduler: Option<Arc<Scheduler>>,
}

// ============================================================================
// Health Check
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub last_snapshot_at: Option<DateTime<Utc>>,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        last_snapshot_at: state.scheduler.as_ref().and_then(|s| s.last_snapshot_at()),
    })
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Serialize)]
pub struct EntityView {
    pub id: String,
    pub display_name: String,
    pub kind: EntityKind,
    pub alert: AlertState,
    /// Health emoji per tick, oldest first
    pub strip: String,
    pub uptime: UptimeSummary,
    pub window: Vec<StatusTick>,
}

#[derive(Serialize)]
pub struct EntitiesResponse {
    pub entities: Vec<EntityView>,
}

fn entity_view(state: &AppState, entity: &MonitoredEntity) -> Result<EntityView, ApiError> {
    let window = state.history.window(&entity.id)?;

    Ok(EntityView {
        id: entity.id.clone(),
        display_name: entity.display_name.clone(),
        kind: entity.kind,
        alert: state.engine.state(&entity.id)?,
        strip: window.iter().map(|t| t.health.emoji()).collect(),
        uptime: state.history.uptime(&entity.id)?,
        window,
    })
}

pub async fn list_entities(
    State(state): State<Arc<AppState>>,
) -> Result<Json<EntitiesResponse>, ApiError> {
    let entities = state
        .entities
        .iter()
        .map(|e| entity_view(&state, e))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(EntitiesResponse { entities }))
}

pub async fn get_entity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<EntityView>, ApiError> {
    let entity = state
        .entities
        .iter()
        .find(|e| e.id == id)
        .ok_or_else(|| ApiError::NotFound(format!("Entity '{}' not found", id)))?;

    Ok(Json(entity_view(&state, entity)?))
}

// ============================================================================
// Subscriptions
// ============================================================================

#[derive(Serialize)]
pub struct SubscriberView {
    pub user_id: String,
    pub subscribed_at: DateTime<Utc>,
    pub role: Option<RoleSync>,
}

#[derive(Serialize)]
pub struct SubscribersResponse {
    pub channel_id: String,
    pub subscribers: Vec<SubscriberView>,
}

pub async fn list_subscribers(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> Result<Json<SubscribersResponse>, ApiError> {
    let subscribers = state
        .registry
        .subscribers(&channel_id)?
        .into_iter()
        .map(|s| SubscriberView {
            role: state.registry.role_sync(&channel_id, &s.user_id),
            user_id: s.user_id,
            subscribed_at: s.subscribed_at,
        })
        .collect();

    Ok(Json(SubscribersResponse {
        channel_id,
        subscribers,
    }))
}

#[derive(Serialize)]
pub struct RoleErrorView {
    pub user_id: String,
    /// False for users who left while their revoke was failing
    pub subscribed: bool,
    pub role: RoleSync,
}

#[derive(Serialize)]
pub struct RoleErrorsResponse {
    pub channel_id: String,
    pub errors: Vec<RoleErrorView>,
}

pub async fn list_role_errors(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> Result<Json<RoleErrorsResponse>, ApiError> {
    let errors = state
        .registry
        .role_errors(&channel_id)?
        .into_iter()
        .map(|(user_id, role)| RoleErrorView {
            subscribed: state.registry.is_subscribed(&user_id, &channel_id),
            user_id,
            role,
        })
        .collect();

    Ok(Json(RoleErrorsResponse { channel_id, errors }))
}

pub async fn clear_role_error(
    State(state): State<Arc<AppState>>,
    Path((channel_id, user_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cleared = state.registry.clear_error(&user_id, &channel_id)?;
    Ok(Json(serde_json::json!({ "cleared": cleared })))
}

#[derive(Serialize)]
pub struct ReactionResponse {
    pub handled: bool,
    pub outcome: Option<SubscriptionOutcome>,
}

pub async fn post_reaction(
    State(state): State<Arc<AppState>>,
    Json(event): Json<ReactionEvent>,
) -> Result<Json<ReactionResponse>, ApiError> {
    let outcome = state.registry.handle_reaction(&event).await?;

    Ok(Json(ReactionResponse {
        handled: outcome.is_some(),
        outcome,
    }))
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Internal(String),
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownChannel(_) => ApiError::NotFound(e.to_string()),
            RegistryError::Persistence(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<HistoryError> for ApiError {
    fn from(e: HistoryError) -> Self {
        match e {
            HistoryError::UnknownEntity(_) => ApiError::NotFound(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::UnknownEntity(_) => ApiError::NotFound(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
