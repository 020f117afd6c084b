//! The engine launcher's own HTTP surface: `POST /launch_goal`, wrapping
//! one agent's `CoordinationEngine`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use conclave_core::CoordinationEngine;
use conclave_schema::LaunchGoalRequest;

#[derive(Clone)]
struct LaunchState {
    engine: Arc<CoordinationEngine>,
}

pub fn router(engine: Arc<CoordinationEngine>) -> Router {
    Router::new()
        .route("/launch_goal", post(launch_goal))
        .layer(TraceLayer::new_for_http())
        .with_state(LaunchState { engine })
}

#[derive(Serialize)]
struct LaunchGoalResponse {
    comm_id: Uuid,
    conclusion: String,
}

#[derive(Serialize)]
struct LaunchGoalError {
    error: String,
}

async fn launch_goal(
    State(state): State<LaunchState>,
    Json(request): Json<LaunchGoalRequest>,
) -> Result<Json<LaunchGoalResponse>, (StatusCode, Json<LaunchGoalError>)> {
    match state.engine.launch_goal(request).await {
        Ok((comm_id, conclusion)) => Ok(Json(LaunchGoalResponse { comm_id, conclusion })),
        Err(error) => Err((StatusCode::BAD_REQUEST, Json(LaunchGoalError { error }))),
    }
}
