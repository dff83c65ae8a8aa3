pub mod errors;
pub mod handlers;
pub mod middlewares;
pub mod routes;
pub mod server;
pub mod types;

// Re-export key types
pub use errors::{ApiError, ApiResult};
pub use routes::create_router;
pub use server::ApiServer;
pub use types::{ApiResponse, ApiState};
