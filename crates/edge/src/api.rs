//! Edge read API.
//!
//! Serves predictions through the decision cache, hands out experiment
//! assignments, and accepts fire-and-forget tracking events. The event
//! write is spawned so it can never block the read path.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use adloop_core::errors::InterfaceError;

use crate::assign::ExperimentAssigner;
use crate::cache::{CacheState, DecisionCache};
use crate::origin::Origin;

#[derive(Clone)]
pub struct EdgeState {
    cache: DecisionCache,
    assigner: Arc<ExperimentAssigner>,
    origin: Arc<dyn Origin>,
}

impl EdgeState {
    pub fn new(
        cache: DecisionCache,
        assigner: Arc<ExperimentAssigner>,
        origin: Arc<dyn Origin>,
    ) -> Self {
        Self { cache, assigner, origin }
    }
}

pub fn router(state: EdgeState) -> Router {
    Router::new()
        .route("/predictions/{entity_id}", get(get_prediction))
        .route("/assignments", post(post_assignment))
        .route("/events", post(post_event))
        .with_state(state)
}

#[derive(Serialize)]
struct PredictionResponse {
    entity_id: String,
    score: f64,
    model_version: u32,
    cache_state: &'static str,
    fresh_until: DateTime<Utc>,
    stale_until: DateTime<Utc>,
}

async fn get_prediction(
    State(state): State<EdgeState>,
    Path(entity_id): Path<String>,
) -> Result<Json<PredictionResponse>, ApiError> {
    let served = state.cache.get(&entity_id, Utc::now()).await.map_err(ApiError)?;
    Ok(Json(PredictionResponse {
        entity_id: served.prediction.entity_id,
        score: served.prediction.score,
        model_version: served.prediction.model_version,
        cache_state: served.cache_state.as_str(),
        fresh_until: served.fresh_until,
        stale_until: served.stale_until,
    }))
}

#[derive(Deserialize)]
struct AssignmentRequest {
    experiment_id: String,
    user_id: String,
    /// Free-form caller context (placement, device, locale). Logged on a
    /// fresh assignment; never part of the bucketing key.
    #[serde(default)]
    context: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct AssignmentResponse {
    experiment_id: String,
    user_id: String,
    variant: String,
    cache_state: &'static str,
    expires_at: DateTime<Utc>,
}

async fn post_assignment(
    State(state): State<EdgeState>,
    Json(request): Json<AssignmentRequest>,
) -> Result<Json<AssignmentResponse>, ApiError> {
    let served = state
        .assigner
        .assign(&request.experiment_id, &request.user_id, Utc::now())
        .await
        .map_err(ApiError)?;
    if served.cache_state == CacheState::Miss {
        debug!(
            event_name = "edge.assignment.computed",
            correlation_id = %served.assignment.user_id,
            experiment_id = %served.assignment.experiment_id,
            variant = %served.assignment.variant,
            context = %request.context.unwrap_or(serde_json::Value::Null),
            "fresh assignment computed"
        );
    }
    Ok(Json(AssignmentResponse {
        experiment_id: served.assignment.experiment_id,
        user_id: served.assignment.user_id,
        variant: served.assignment.variant,
        cache_state: served.cache_state.as_str(),
        expires_at: served.assignment.expires_at,
    }))
}

async fn post_event(
    State(state): State<EdgeState>,
    Json(event): Json<serde_json::Value>,
) -> StatusCode {
    let origin = state.origin.clone();
    tokio::spawn(async move {
        if let Err(error) = origin.publish_event(event).await {
            // Accepted means best-effort; a lost event is logged, not surfaced.
            debug!(
                event_name = "edge.event.publish_failed",
                correlation_id = "events",
                error = %error,
                "tracking event dropped after origin failure"
            );
        }
    });
    StatusCode::ACCEPTED
}

struct ApiError(InterfaceError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, retry_after) = match &self.0 {
            InterfaceError::BadRequest { .. } => (StatusCode::BAD_REQUEST, None),
            InterfaceError::NotFound { .. } => (StatusCode::NOT_FOUND, None),
            InterfaceError::Unavailable { retry_after_secs, .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, Some(*retry_after_secs))
            }
            InterfaceError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
