//! HTTP-01 challenge responder
//!
//! Holds the token -> key authorization table and serves it under
//! `/.well-known/acme-challenge/<token>`.

use std::sync::Arc;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use dashmap::DashMap;
use tracing::{debug, trace};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Pending HTTP-01 challenges.
///
/// Clones share the same table, so the coordinator publishes into the same
/// map the HTTP listener reads from.
#[derive(Debug, Clone, Default)]
pub struct Http01Responder {
    /// Map of challenge token -> key authorization response
    challenges: Arc<DashMap<String, String>>,
}

impl Http01Responder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a token
    pub fn publish(&self, token: &str, key_authorization: &str) {
        debug!(token = %token, "Publishing HTTP-01 challenge");
        self.challenges
            .insert(token.to_string(), key_authorization.to_string());
    }

    /// Withdraw a token; returns whether it was present
    pub fn withdraw(&self, token: &str) -> bool {
        let removed = self.challenges.remove(token).is_some();
        if removed {
            debug!(token = %token, "Withdrew HTTP-01 challenge");
        }
        removed
    }

    /// Key authorization for a token
    pub fn response_for(&self, token: &str) -> Option<String> {
        let result = self.challenges.get(token).map(|v| v.clone());
        trace!(token = %token, found = result.is_some(), "HTTP-01 challenge lookup");
        result
    }

    /// Number of published tokens
    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }

    /// Router serving the published tokens
    pub fn router(&self) -> Router {
        Router::new()
            .route(&format!("{}:token", ACME_CHALLENGE_PREFIX), get(serve_challenge))
            .with_state(self.clone())
    }
}

async fn serve_challenge(
    State(responder): State<Http01Responder>,
    Path(token): Path<String>,
) -> Response {
    match responder.response_for(&token) {
        Some(key_authorization) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            key_authorization,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
