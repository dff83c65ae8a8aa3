use axum::{
    extract::{Query, State},
    Json,
};
use tracing::debug;

use crate::api::errors::ApiResult;
use crate::api::types::{ApiResponse, ApiState, HealthQuery, DEFAULT_HEALTH_WINDOW_DAYS};
use crate::controller::HealthReport;
use crate::error::Error;

/// Health check handler
///
/// `GET /health?within_days=N`
///
/// Counts stored certificates; `status` turns `degraded` once any of them has
/// expired.
pub async fn health_check(
    State(state): State<ApiState>,
    Query(query): Query<HealthQuery>,
) -> ApiResult<Json<ApiResponse<HealthReport>>> {
    let within_days = query.within_days.unwrap_or(DEFAULT_HEALTH_WINDOW_DAYS);
    if within_days < 0 {
        return Err(Error::InvalidRequest("within_days must not be negative".into()).into());
    }
    debug!(within_days, "Health check requested");

    let report = state
        .orchestrator
        .health(chrono::Duration::days(within_days))
        .await?;
    Ok(Json(ApiResponse::success(report)))
}
