use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
};

use crate::api::errors::ApiResult;
use crate::api::types::ApiState;

/// Prometheus text exposition
///
/// `GET /metrics`
pub async fn get_metrics(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let body = state.metrics.gather_text()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
