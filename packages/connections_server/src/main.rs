use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

mod app;
mod config;

use http_connections::{ConnectionMetrics, ConnectionRegistry};

use crate::config::{FileConfig, ServerConfig, load_config};

/// Span maker that tags every request with a fresh UUID.
#[derive(Clone, Debug)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = uuid::Uuid::new_v4();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser, Debug)]
#[command(name = "connections-server")]
#[command(about = "Serve the multi-transport connection endpoint with an echo application")]
struct Cli {
    /// TOML config file (missing is fine; defaults and env vars still apply)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the listen host
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the endpoint mount path
    #[arg(long)]
    path: Option<String>,

    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "connections_server=debug,http_connections=debug,tower_http=debug,info"
    } else {
        "connections_server=info,http_connections=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut fc: FileConfig = load_config(&cli.config)
        .extract()
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    if let Some(host) = cli.host {
        fc.server.host = host;
    }
    if let Some(port) = cli.port {
        fc.server.port = port;
    }
    if let Some(path) = cli.path {
        fc.server.path = path;
    }
    let config = ServerConfig::from_file(&fc)?;

    run_server(config).await
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let registry = Arc::new(ConnectionRegistry::new(
        config.registry.clone(),
        Arc::new(ConnectionMetrics::new()),
    ));

    let shutdown = CancellationToken::new();
    let sweeper = registry.spawn_sweeper(config.sweep_interval, shutdown.clone());

    let app = app::build_router(&config, registry.clone(), app::echo_application())
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Listening on http://{}", actual_addr);
    info!("  POST {}/negotiate  - Negotiate a connection", config.path);
    info!("  GET  {}?id=        - WebSockets / SSE / long poll", config.path);
    info!("  POST {}?id=        - Send to the application", config.path);
    info!("  GET  /health, /metrics");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = app::serve(listener, app, registry.clone(), shutdown_signal).await;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!("Sweeper task ended abnormally: {}", e);
    }

    info!("Shutdown complete");
    server_result
}
