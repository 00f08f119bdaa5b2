//! HTTP handlers for the adaptive-learning API.
//!
//! Caller mistakes (malformed bodies) surface as 4xx; asynchronous
//! degradation (a capability service timing out) surfaces as a `PARTIAL`
//! workflow result with status 200, never a 5xx.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::adaptive::AdaptiveEngine;
use crate::error::WorkflowError;

/// Map a workflow error to its HTTP status.
///
/// Unknown workflow names are a caller mistake; a stopped broker is a
/// service-side condition.
fn workflow_status(error: &WorkflowError) -> StatusCode {
    match error {
        WorkflowError::UnknownWorkflow(_) => StatusCode::BAD_REQUEST,
        WorkflowError::BrokerStopped => StatusCode::SERVICE_UNAVAILABLE,
        WorkflowError::Append(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
pub struct InteractionBody {
    pub user_id: String,
    pub session_id: String,
    #[serde(default)]
    pub payload: Value,
    /// Optional idempotency key carried across retried delivery.
    pub event_id: Option<Uuid>,
}

pub async fn record_interaction(
    State(engine): State<Arc<AdaptiveEngine>>,
    Json(body): Json<InteractionBody>,
) -> Result<Json<Value>, StatusCode> {
    let outcome = engine
        .record_interaction(&body.user_id, &body.session_id, body.payload, body.event_id)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to record interaction");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(json!({
        "event_id": outcome.event_id,
        "duplicate": outcome.duplicate,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SkillProgressBody {
    pub user_id: String,
    pub session_id: String,
    pub skill: String,
    pub score: f64,
    #[serde(default)]
    pub time_spent: f64,
}

pub async fn record_skill_progress(
    State(engine): State<Arc<AdaptiveEngine>>,
    Json(body): Json<SkillProgressBody>,
) -> Result<Json<Value>, StatusCode> {
    let outcome = engine
        .record_skill_progress(
            &body.user_id,
            &body.session_id,
            &body.skill,
            body.score,
            body.time_spent,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to record skill progress");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(serde_json::to_value(outcome).map_err(|e| {
        tracing::error!(error = %e, "failed to serialize outcome");
        StatusCode::INTERNAL_SERVER_ERROR
    })?))
}

#[derive(Debug, Deserialize)]
pub struct AdaptiveLearningBody {
    pub user_id: String,
    pub session_id: String,
    #[serde(default)]
    pub context: Value,
}

pub async fn run_adaptive_learning(
    State(engine): State<Arc<AdaptiveEngine>>,
    Json(body): Json<AdaptiveLearningBody>,
) -> Result<Json<Value>, StatusCode> {
    let result = engine
        .run_adaptive_learning(&body.user_id, &body.session_id, body.context)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "adaptive learning workflow failed");
            workflow_status(&e)
        })?;

    Ok(Json(serde_json::to_value(result).map_err(|e| {
        tracing::error!(error = %e, "failed to serialize workflow result");
        StatusCode::INTERNAL_SERVER_ERROR
    })?))
}

#[derive(Debug, Deserialize)]
pub struct MultimodalBody {
    pub user_id: String,
    pub text: Option<Value>,
    pub image: Option<Value>,
    pub audio: Option<Value>,
}

pub async fn run_multimodal_analysis(
    State(engine): State<Arc<AdaptiveEngine>>,
    Json(body): Json<MultimodalBody>,
) -> Result<Json<Value>, StatusCode> {
    let mut input = serde_json::Map::new();
    if let Some(text) = body.text {
        input.insert("text".to_string(), text);
    }
    if let Some(image) = body.image {
        input.insert("image".to_string(), image);
    }
    if let Some(audio) = body.audio {
        input.insert("audio".to_string(), audio);
    }

    let result = engine
        .run_multimodal(&body.user_id, Value::Object(input))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "multimodal workflow failed");
            workflow_status(&e)
        })?;

    Ok(Json(serde_json::to_value(result).map_err(|e| {
        tracing::error!(error = %e, "failed to serialize workflow result");
        StatusCode::INTERNAL_SERVER_ERROR
    })?))
}

pub async fn user_progress(
    State(engine): State<Arc<AdaptiveEngine>>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let (progress, analytics) = engine.user_progress(&user_id).await;
    Ok(Json(json!({
        "user_id": user_id,
        "progress": progress,
        "analytics": analytics,
    })))
}

pub async fn services_health(
    State(engine): State<Arc<AdaptiveEngine>>,
) -> Result<Json<Value>, StatusCode> {
    let health = engine.services_health().await;
    Ok(Json(json!({"services": health})))
}
