use axum::{
    extract::{Path, State},
    Json,
};

use crate::api::errors::ApiResult;
use crate::api::types::{ApiResponse, ApiState};
use crate::propagation::PropagationResult;

/// `GET /propagations/{task_id}`
pub async fn propagation_status(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<ApiResponse<PropagationResult>>> {
    let result = state.orchestrator.propagation_status(&task_id)?;
    Ok(Json(ApiResponse::success(result)))
}

/// `DELETE /propagations/{task_id}`: cancel an async propagation
pub async fn cancel_propagation(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<ApiResponse<PropagationResult>>> {
    let result = state.orchestrator.cancel_propagation(&task_id)?;
    Ok(Json(ApiResponse::success(result)))
}
