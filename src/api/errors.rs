use axum::{response::{IntoResponse, Response}, http::StatusCode, Json};
use tracing::{error, warn};

use crate::api::types::ApiResponse;
use crate::error::Error;

/// Handler result
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Crate error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::AlreadyExists(_)
            | Error::InvalidTransition { .. }
            | Error::RenewalInProgress(_)
            | Error::RenewalNotDue { .. }
            | Error::RetryLimitExceeded { .. } => StatusCode::CONFLICT,
            Error::ChallengeValidationFailed { .. }
            | Error::ChallengeTimeout { .. }
            | Error::RevocationFailed { .. } => StatusCode::BAD_GATEWAY,
            Error::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = %status, error = %self.0, "Request failed");
        } else {
            warn!(status = %status, error = %self.0, "Request rejected");
        }

        let body = Json(ApiResponse::<()>::error(self.0.to_string()));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::ChallengeType;
    use crate::lifecycle::{CertificateState, LifecycleEvent};

    #[test]
    fn test_status_mapping() {
        let cases = vec![
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (
                Error::InvalidTransition {
                    id: "x".into(),
                    state: CertificateState::Revoked,
                    event: LifecycleEvent::Revoke,
                },
                StatusCode::CONFLICT,
            ),
            (Error::RenewalInProgress("x".into()), StatusCode::CONFLICT),
            (
                Error::ChallengeTimeout {
                    challenge_type: ChallengeType::Dns01,
                    domains: vec!["example.com".into()],
                    timeout_secs: 300,
                },
                StatusCode::BAD_GATEWAY,
            ),
            (Error::StoreUnavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::StoreCorrupted("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }
}
