//! HTTP surface: router assembly over the adaptive engine.

pub mod handlers;

use std::sync::Arc;

use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::adaptive::AdaptiveEngine;

/// Build the API router over a shared engine.
///
/// All bodies are JSON and all routes are safe to retry: writes carry
/// idempotency keys and reads are pure.
pub fn router(engine: Arc<AdaptiveEngine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/adaptive/interaction", post(handlers::record_interaction))
        .route(
            "/api/adaptive/skill-progress",
            post(handlers::record_skill_progress),
        )
        .route(
            "/api/adaptive/adaptive-learning",
            post(handlers::run_adaptive_learning),
        )
        .route(
            "/api/adaptive/multimodal-analysis",
            post(handlers::run_multimodal_analysis),
        )
        .route(
            "/api/adaptive/user-progress/:user_id",
            get(handlers::user_progress),
        )
        .route(
            "/api/adaptive/services-health",
            get(handlers::services_health),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(engine)
}
