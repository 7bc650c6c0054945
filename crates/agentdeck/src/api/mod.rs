//! HTTP API module.
//!
//! REST and SSE endpoints over the distribution layer.

mod error;
mod handlers;
mod routes;
mod state;

// Re-export error types for external use
#[allow(unused_imports)]
pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
