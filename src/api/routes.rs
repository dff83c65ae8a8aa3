use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::api::types::ApiState;
use crate::api::middlewares::logging_middleware;
use crate::api::handlers::{
    certificates::{
        delete_certificate, get_certificate, issue_certificate, list_certificates,
        propagate_certificate, renew_certificate, revoke_certificate,
    },
    health::health_check,
    metrics::get_metrics,
    propagations::{cancel_propagation, propagation_status},
};

/// Create router with all API routes
pub fn create_router(state: ApiState) -> Router {
    // Public routes
    let public_routes = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics));

    // Certificate routes
    let certificate_routes = Router::new()
        .route("/certificates", get(list_certificates).post(issue_certificate))
        .route("/certificates/:id", get(get_certificate).delete(delete_certificate))
        .route("/certificates/:id/renew", post(renew_certificate))
        .route("/certificates/:id/revoke", post(revoke_certificate))
        .route("/certificates/:id/propagate", post(propagate_certificate))
        .route("/propagations/:task_id", get(propagation_status).delete(cancel_propagation));

    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(logging_middleware));

    Router::new()
        .merge(public_routes)
        .merge(certificate_routes)
        .layer(middleware_stack)
        .with_state(state)
}
