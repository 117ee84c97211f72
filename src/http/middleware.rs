//! Admission middleware for axum.
//!
//! ```rust,ignore
//! let group = Arc::new(PolicyGroup::from_config(&config.rate_limiting)?);
//! let app = Router::new()
//!     .route("/api/tracks", post(upload_track))
//!     .layer(axum::middleware::from_fn_with_state(group, admission_middleware));
//! ```

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{trace, warn};

use crate::ratelimit::{Admission, ClientIdentity, LimiterRegistry, PolicyGroup};

/// Seconds clients are told to wait. Fixed, not derived from refill time.
pub const RETRY_AFTER_SECS: u64 = 60;

/// Message returned in the body of every rejection.
pub const REJECTION_MESSAGE: &str = "Too many requests, please try again later";

/// The response sent when a request is over its limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitRejection;

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));

        (
            StatusCode::TOO_MANY_REQUESTS,
            headers,
            Json(json!({
                "success": false,
                "error": REJECTION_MESSAGE,
            })),
        )
            .into_response()
    }
}

/// Resolve the client identity of a request from its headers and the
/// connection address axum recorded, if any.
pub fn resolve_identity(headers: &HeaderMap, extensions: &axum::http::Extensions) -> ClientIdentity {
    let remote_addr = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string());
    ClientIdentity::resolve(headers, remote_addr.as_deref())
}

/// Rate limit each request under the policy its method and path select.
///
/// Requests no rule matches pass straight through. The resolved
/// [`ClientIdentity`] is stored in the request extensions for handlers.
pub async fn admission_middleware(
    State(group): State<Arc<PolicyGroup>>,
    mut request: Request,
    next: Next,
) -> Response {
    let identity = resolve_identity(request.headers(), request.extensions());

    match group.check(request.method(), request.uri().path(), &identity) {
        Admission::Rejected { policy } => {
            warn!(
                client = %identity,
                policy = %policy,
                method = %request.method(),
                path = %request.uri().path(),
                "Rate limit exceeded"
            );
            RateLimitRejection.into_response()
        }
        admission => {
            trace!(client = %identity, ?admission, "Request admitted");
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
    }
}

/// Rate limit every request against a single registry, keyed by client.
pub async fn client_limit_middleware(
    State(registry): State<Arc<LimiterRegistry>>,
    mut request: Request,
    next: Next,
) -> Response {
    let identity = resolve_identity(request.headers(), request.extensions());

    if !registry.allow(identity.as_str()) {
        warn!(
            client = %identity,
            method = %request.method(),
            path = %request.uri().path(),
            "Rate limit exceeded"
        );
        return RateLimitRejection.into_response();
    }

    request.extensions_mut().insert(identity);
    next.run(request).await
}

#[async_trait]
impl<S> FromRequestParts<S> for ClientIdentity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(identity) = parts.extensions.get::<ClientIdentity>() {
            return Ok(identity.clone());
        }
        Ok(resolve_identity(&parts.headers, &parts.extensions))
    }
}
