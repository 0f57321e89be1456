//! cursorway Gateway Service
//!
//! Exposes database cursors over HTTP. Supports:
//! - Data source, connection and cursor management
//! - Paged fetch with bounded per-cursor buffering
//! - Prometheus metrics (/metrics)

mod cursors;
mod errors;
mod execution;
mod http_api;
mod metrics;
mod registry;
mod row_channel;
mod telemetry;

use crate::http_api::AppState;
use crate::registry::Registry;
use clap::Parser;
use cursorway_common::GatewayConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "cursorway-gateway")]
#[command(about = "cursorway Gateway Service - database cursors over HTTP")]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, env = "CURSORWAY_CONFIG")]
    config: Option<PathBuf>,

    /// REST API port (overrides the configuration file)
    #[arg(long, env = "HTTP_PORT")]
    http_port: Option<u16>,

    /// Log level (overrides the configuration file)
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let mut config = GatewayConfig::load(args.config.as_deref())?;
    if let Some(port) = args.http_port {
        config.http.port = port;
    }
    if let Some(level) = args.log_level {
        config.telemetry.log_level = level;
    }
    config.telemetry.json_logs |= args.json_logs;

    telemetry::init(&config.telemetry.log_level, config.telemetry.json_logs)?;

    info!("Starting cursorway Gateway");
    info!("  HTTP port: {}", config.http.port);
    info!("  Row buffer capacity: {}", config.cursors.row_buffer_capacity);
    info!("  Idle cursor timeout: {}s", config.cursors.idle_timeout_secs);

    // Initialize Prometheus metrics
    metrics::init_metrics();

    let registry = Arc::new(Registry::new(
        config.engine.clone(),
        config.cursors.clone(),
    ));
    for data_source in &config.data_sources {
        let registry = registry.clone();
        let settings = data_source.clone();
        tokio::task::spawn_blocking(move || {
            registry.add_data_source(&settings.name, &settings.url, settings.user)
        })
        .await??;
    }

    let reaper = registry::start_reaper(registry.clone());

    // CORS layer for frontend access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = http_api::router(AppState {
        registry: registry.clone(),
    })
    .layer(TraceLayer::new_for_http())
    .layer(cors);

    let http_addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port).parse()?;
    let listener = tokio::net::TcpListener::bind(&http_addr).await?;
    info!("HTTP server listening on {}", http_addr);
    info!("  /api/database/dataSources/ - Data sources, connections and cursors");
    info!("  /metrics - Prometheus metrics");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("HTTP server failed: {}", e);
    }

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    tokio::task::spawn_blocking(move || registry.dispose_all()).await?;
    info!("cursorway Gateway stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down cursorway Gateway");
}
