use axum::{http::StatusCode, routing::get, Json, Router};
use clap::{Parser, ValueEnum};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use trackgate::config::TrackgateConfig;
use trackgate::http::HttpServer;
use trackgate::ratelimit::PolicyGroup;

/// Per-client admission control for the track library API.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "TRACKGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration file
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    match args.log_format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }

    info!("Starting Trackgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TrackgateConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        policies = config.rate_limiting.policies.len(),
        rules = config.rate_limiting.rules.len(),
        "Configuration loaded"
    );

    // Fails here, before any traffic, on a bad policy or rule
    let policies = Arc::new(PolicyGroup::from_config(&config.rate_limiting)?);
    info!(policies = ?policies, "Rate limiter initialized");

    let server = HttpServer::new(config.server.listen_addr, policies)
        .with_routes(track_routes())
        .with_max_body_bytes(config.server.max_body_bytes);

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Trackgate stopped");
    Ok(())
}

/// Track endpoints. Storage lives in a separate service, so these only
/// answer once the admission layer has let the request through.
fn track_routes() -> Router {
    Router::new()
        .route(
            "/api/tracks",
            get(not_configured).post(not_configured),
        )
        .route(
            "/api/tracks/:id",
            get(not_configured).delete(not_configured),
        )
        .route("/api/tracks/:id/download", get(not_configured))
}

async fn not_configured() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(json!({
            "success": false,
            "error": "track storage backend not configured",
        })),
    )
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
