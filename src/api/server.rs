use std::future::Future;
use std::net::SocketAddr;
use axum::Router;
use tracing::{error, info};

use crate::api::routes;
use crate::api::types::ApiState;
use crate::config::Settings;
use crate::error::Error;

/// HTTP listener for a router, with graceful shutdown
pub struct ApiServer {
    /// Listening address
    address: SocketAddr,
    /// Router
    router: Router,
}

impl ApiServer {
    /// REST API server on `api.listen_addr`
    pub fn new(settings: &Settings, state: ApiState) -> Result<Self, Error> {
        let address = settings.api_address()?;
        Ok(Self::with_router(address, routes::create_router(state)))
    }

    /// Server for any router, e.g. the HTTP-01 responder
    pub fn with_router(address: SocketAddr, router: Router) -> Self {
        Self { address, router }
    }

    /// Serve until `shutdown` resolves
    pub async fn serve_with_shutdown<F>(self, name: &str, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(server = name, address = %self.address, "Starting server");

        let server = axum::Server::try_bind(&self.address)
            .map_err(|e| Error::Config(format!("Cannot bind {} to {}: {}", name, self.address, e)))?
            .serve(self.router.into_make_service())
            .with_graceful_shutdown(shutdown);

        if let Err(e) = server.await {
            error!(server = name, error = %e, "Server error");
            return Err(Error::Internal(format!("{} server error: {}", name, e)));
        }

        info!(server = name, "Server shut down gracefully");
        Ok(())
    }

    /// Get the listening address
    pub fn address(&self) -> &SocketAddr {
        &self.address
    }

    /// Get the router
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}
