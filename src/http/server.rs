//! HTTP server implementation.

use axum::{extract::DefaultBodyLimit, routing::get, Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tracing::{error, info};

use super::middleware::admission_middleware;
use crate::error::Result;
use crate::ratelimit::PolicyGroup;

/// Path of the liveness endpoint. No dispatch rule should match it.
pub const HEALTH_PATH: &str = "/api/health";

/// HTTP server that puts the admission layer in front of the API routes.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Rate limit policies shared by every request
    policies: Arc<PolicyGroup>,
    /// Downstream API routes
    routes: Router,
    /// Largest accepted request body in bytes
    max_body_bytes: usize,
}

impl HttpServer {
    /// Create a server with only the health endpoint mounted.
    pub fn new(addr: SocketAddr, policies: Arc<PolicyGroup>) -> Self {
        Self {
            addr,
            policies,
            routes: Router::new(),
            max_body_bytes: 5 * 1024 * 1024,
        }
    }

    /// Mount the downstream API routes.
    pub fn with_routes(mut self, routes: Router) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    /// The complete application: API routes plus health check, wrapped in
    /// the admission middleware.
    pub fn router(&self) -> Router {
        build_router(
            Arc::clone(&self.policies),
            self.routes.clone(),
            self.max_body_bytes,
        )
    }

    /// Serve until `signal` resolves, then stop the eviction sweepers.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        let app = self.router();

        info!(addr = %local_addr, "Starting HTTP server with graceful shutdown");

        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await;

        self.policies.shutdown().await;

        served.map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

/// Wrap `routes` and the health endpoint in the admission middleware.
pub fn build_router(policies: Arc<PolicyGroup>, routes: Router, max_body_bytes: usize) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .merge(routes)
        .layer(
            ServiceBuilder::new()
                .layer(DefaultBodyLimit::max(max_body_bytes))
                .layer(axum::middleware::from_fn_with_state(
                    policies,
                    admission_middleware,
                )),
        )
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::middleware::REJECTION_MESSAGE;
    use crate::ratelimit::{ManualClock, PolicyConfig, RuleConfig};
    use axum::{
        body::{to_bytes, Body},
        extract::{ConnectInfo, Request},
        http::{header, Method, StatusCode},
        routing::post,
    };
    use std::time::Duration;
    use tower::ServiceExt;

    /// Stand-in track handlers: upload answers 201, reads answer 200.
    fn track_routes() -> Router {
        Router::new()
            .route(
                "/api/tracks",
                post(|| async { (StatusCode::CREATED, Json(json!({ "success": true }))) })
                    .get(|| async { Json(json!({ "success": true, "data": [] })) }),
            )
            .route(
                "/api/tracks/:id/download",
                get(|| async { Json(json!({ "success": true })) }),
            )
    }

    fn track_policies(clock: ManualClock) -> Arc<PolicyGroup> {
        let mut group = PolicyGroup::with_clock(Arc::new(clock));
        group.add("upload", PolicyConfig::new(2.0, 2)).unwrap();
        group.add("download", PolicyConfig::new(5.0, 5)).unwrap();
        group.add("list", PolicyConfig::new(10.0, 10)).unwrap();
        group.add_rule(&RuleConfig::new("POST", "/api/tracks", "upload")).unwrap();
        group
            .add_rule(&RuleConfig::new("GET", "/api/tracks/{id}/download", "download"))
            .unwrap();
        group.add_rule(&RuleConfig::new("GET", "/api/tracks", "list")).unwrap();
        Arc::new(group)
    }

    fn app(policies: Arc<PolicyGroup>) -> Router {
        HttpServer::new("127.0.0.1:0".parse().unwrap(), policies)
            .with_routes(track_routes())
            .router()
    }

    fn request(method: Method, path: &str, header: Option<(&'static str, &str)>) -> Request {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some((name, value)) = header {
            builder = builder.header(name, value);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("10.1.1.1:40000".parse().unwrap()));
        request
    }

    #[tokio::test]
    async fn test_upload_burst_then_429() {
        let policies = track_policies(ManualClock::new());
        let app = app(Arc::clone(&policies));
        let client = Some(("x-real-ip", "192.168.1.100"));

        for i in 0..2 {
            let response = app
                .clone()
                .oneshot(request(Method::POST, "/api/tracks", client))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED, "request {}", i + 1);
        }

        let response = app
            .oneshot(request(Method::POST, "/api/tracks", client))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], REJECTION_MESSAGE);

        policies.shutdown().await;
    }

    #[tokio::test]
    async fn test_x_forwarded_for_shares_bucket() {
        let policies = track_policies(ManualClock::new());
        let app = app(Arc::clone(&policies));
        let client = Some(("x-forwarded-for", "203.0.113.195, 70.41.3.18"));

        let mut statuses = Vec::new();
        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(request(Method::POST, "/api/tracks", client))
                .await
                .unwrap();
            statuses.push(response.status());
        }

        assert_eq!(
            statuses,
            vec![
                StatusCode::CREATED,
                StatusCode::CREATED,
                StatusCode::TOO_MANY_REQUESTS
            ]
        );
        assert!(policies
            .policy("upload")
            .unwrap()
            .registry()
            .contains("203.0.113.195"));

        policies.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_check_never_limited() {
        let policies = track_policies(ManualClock::new());
        let app = app(Arc::clone(&policies));

        for i in 0..50 {
            let response = app
                .clone()
                .oneshot(request(Method::GET, HEALTH_PATH, Some(("x-real-ip", "192.168.1.1"))))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "health check {}", i + 1);
        }

        for name in policies.policy_names() {
            assert!(policies.policy(name).unwrap().registry().is_empty());
        }

        policies.shutdown().await;
    }

    #[tokio::test]
    async fn test_different_clients_do_not_interfere() {
        let policies = track_policies(ManualClock::new());
        let app = app(Arc::clone(&policies));

        for ip in ["192.168.1.1", "192.168.1.2", "192.168.1.3"] {
            let response = app
                .clone()
                .oneshot(request(Method::GET, "/api/tracks", Some(("x-real-ip", ip))))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "request from {}", ip);
        }

        policies.shutdown().await;
    }

    #[tokio::test]
    async fn test_upload_refills_after_wait() {
        let clock = ManualClock::new();
        let policies = track_policies(clock.clone());
        let app = app(Arc::clone(&policies));
        let client = Some(("x-real-ip", "192.168.1.100"));

        for _ in 0..2 {
            app.clone()
                .oneshot(request(Method::POST, "/api/tracks", client))
                .await
                .unwrap();
        }

        clock.advance(Duration::from_millis(500));

        let statuses: Vec<StatusCode> = futures::future::join_all((0..2).map(|_| {
            app.clone()
                .oneshot(request(Method::POST, "/api/tracks", client))
        }))
        .await
        .into_iter()
        .map(|r| r.unwrap().status())
        .collect();

        assert_eq!(
            statuses.iter().filter(|s| **s == StatusCode::CREATED).count(),
            1
        );
        assert_eq!(
            statuses
                .iter()
                .filter(|s| **s == StatusCode::TOO_MANY_REQUESTS)
                .count(),
            1
        );

        policies.shutdown().await;
    }

    #[tokio::test]
    async fn test_serve_with_shutdown_stops_sweepers() {
        let policies = track_policies(ManualClock::new());
        let server = HttpServer::new("127.0.0.1:0".parse().unwrap(), Arc::clone(&policies));

        server
            .serve_with_shutdown(tokio::time::sleep(Duration::from_millis(20)))
            .await
            .unwrap();

        for name in policies.policy_names() {
            assert!(!policies.policy(name).unwrap().registry().is_sweeping());
        }
    }
}
