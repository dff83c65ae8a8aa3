use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use tracing::info;

use crate::acme::RevocationReason;
use crate::api::errors::ApiResult;
use crate::api::types::{ApiResponse, ApiState, ListQuery, PropagateBody, RenewBody, RevokeBody};
use crate::domain::{CertificateSummary, IssueRequest};
use crate::propagation::PropagationResult;

/// `GET /certificates`
pub async fn list_certificates(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<ApiResponse<Vec<CertificateSummary>>>> {
    let certificates = state.orchestrator.list(&query.to_filter()).await?;
    Ok(Json(ApiResponse::success(certificates)))
}

/// `POST /certificates`
///
/// Runs validation and issuance before answering. A failed attempt leaves
/// the certificate FAILED and is reported with the failing domains.
pub async fn issue_certificate(
    State(state): State<ApiState>,
    Json(request): Json<IssueRequest>,
) -> ApiResult<(StatusCode, Json<ApiResponse<CertificateSummary>>)> {
    info!(domains = ?request.domains, "Issuance requested over API");
    let certificate = state.orchestrator.issue(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(certificate.summary()))))
}

/// `GET /certificates/{id}`
pub async fn get_certificate(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<CertificateSummary>>> {
    let certificate = state.orchestrator.get(&id).await?;
    Ok(Json(ApiResponse::success(certificate)))
}

/// `DELETE /certificates/{id}`
pub async fn delete_certificate(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<String>>> {
    state.orchestrator.delete(&id).await?;
    Ok(Json(ApiResponse::success(id)))
}

/// `POST /certificates/{id}/renew`
pub async fn renew_certificate(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Option<Json<RenewBody>>,
) -> ApiResult<Json<ApiResponse<CertificateSummary>>> {
    let force = body.map(|Json(body)| body.force).unwrap_or(false);
    let certificate = state.orchestrator.renew(&id, force).await?;
    Ok(Json(ApiResponse::success(certificate.summary())))
}

/// `POST /certificates/{id}/revoke`
pub async fn revoke_certificate(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Option<Json<RevokeBody>>,
) -> ApiResult<Json<ApiResponse<CertificateSummary>>> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let reason = match body.reason.as_deref() {
        Some(reason) => reason.parse::<RevocationReason>()?,
        None => RevocationReason::default(),
    };

    let certificate = state.orchestrator.revoke(&id, reason, body.purge).await?;
    Ok(Json(ApiResponse::success(certificate.summary())))
}

/// `POST /certificates/{id}/propagate`
pub async fn propagate_certificate(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Option<Json<PropagateBody>>,
) -> ApiResult<Json<ApiResponse<PropagationResult>>> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let result = state
        .orchestrator
        .propagate(&id, body.strategy, body.regions)
        .await?;
    Ok(Json(ApiResponse::success(result)))
}
