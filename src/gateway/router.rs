//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use super::middleware::{MiddlewareState, auth_middleware};
use super::{AuthGateway, HealthReport};
use crate::failsafe::CircuitState;
use crate::remote::IdentityHealth;
use crate::token::Identity;

/// Shared application state
pub struct AppState {
    /// Authentication gateway
    pub gateway: Arc<AuthGateway>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>, auth: Arc<MiddlewareState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/identity", get(identity_handler))
        .layer(middleware::from_fn_with_state(auth, auth_middleware))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - breaker states and identity service health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report: HealthReport = state.gateway.health().await;
    let healthy = report
        .circuit_breakers
        .iter()
        .all(|b| b.state != CircuitState::Open.as_str())
        && report
            .identity_service
            .is_none_or(|health| health == IdentityHealth::Up);

    let status = if healthy { "healthy" } else { "degraded" };
    (
        StatusCode::OK,
        Json(json!({
            "status": status,
            "version": env!("CARGO_PKG_VERSION"),
            "circuitBreakers": report.circuit_breakers,
            "identityService": report.identity_service,
        })),
    )
}

/// GET /api/v1/identity - the caller's resolved identity
async fn identity_handler(Extension(identity): Extension<Identity>) -> Json<Identity> {
    Json(identity)
}
