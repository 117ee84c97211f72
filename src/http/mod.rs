//! HTTP integration: admission middleware and server wiring.

mod middleware;
mod server;

pub use middleware::{
    admission_middleware, client_limit_middleware, resolve_identity, RateLimitRejection,
    REJECTION_MESSAGE, RETRY_AFTER_SECS,
};
pub use server::{build_router, HttpServer, HEALTH_PATH};
