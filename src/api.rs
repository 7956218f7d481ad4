//! Operator HTTP surface
//!
//! Read-only views over the orchestrator registry and payment records.

use crate::application::actors::orchestrator::{OrchestratorHandle, SessionSummary};
use crate::application::services::payment_desk::PaymentDesk;
use crate::domain::entities::payment::PaymentView;
use crate::domain::errors::PaymentError;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: OrchestratorHandle,
    pub payments: Arc<PaymentDesk>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_sessions: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/sessions", get(list_sessions))
        .route("/payments/:tenant_id", get(payment_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match state.orchestrator.active_sessions().await {
        Ok(sessions) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "running".to_string(),
                active_sessions: sessions.iter().filter(|s| s.state.is_live()).count(),
            }),
        ),
        Err(e) => {
            error!("Health check could not reach orchestrator: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded".to_string(),
                    active_sessions: 0,
                }),
            )
        }
    }
}

async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    state
        .orchestrator
        .active_sessions()
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
}

async fn payment_status(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<PaymentView>, ApiError> {
    match state.payments.status(&tenant_id).await {
        Ok(view) => Ok(Json(view)),
        Err(e @ PaymentError::NotFound(_)) => Err(api_error(StatusCode::NOT_FOUND, e.to_string())),
        Err(e) => {
            error!("Failed to load payment for tenant {}: {}", tenant_id, e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}
