use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use http_connections::{
    ApplicationConnection, ConnectionHandler, ConnectionRegistry, HttpConnectionDispatcher,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub connections: u64,
    pub uptime_secs: u64,
}

/// Writes every chunk a client sends straight back to it.
pub fn echo_application() -> Arc<dyn ConnectionHandler> {
    Arc::new(|connection: ApplicationConnection| async move {
        debug!(
            connection_id = %connection.connection_id(),
            transport = ?connection.transport_type(),
            "echo started"
        );
        loop {
            let read = connection.input().read().await?;
            if !read.buffer.is_empty() {
                let flush = connection.output().write(read.buffer).await?;
                if flush.is_completed {
                    break;
                }
            }
            if read.is_completed {
                break;
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.registry.metrics().snapshot();
    Json(HealthStatus {
        status: "healthy".to_string(),
        connections: metrics.connections.current,
        uptime_secs: metrics.uptime_secs,
    })
}

pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.metrics().snapshot())
}

/// Health and metrics at the top level, the connection endpoint under `config.path`.
pub fn build_router(
    config: &ServerConfig,
    registry: Arc<ConnectionRegistry>,
    handler: Arc<dyn ConnectionHandler>,
) -> Router {
    let dispatcher = HttpConnectionDispatcher::new(registry.clone(), config.endpoint.clone(), handler);

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(AppState { registry })
        .nest(&config.path, dispatcher.router())
}

/// Serve `router` until `signal` resolves.
///
/// Connections are disposed before hyper starts draining, otherwise open event
/// streams and outstanding polls would hold the drain open.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    registry: Arc<ConnectionRegistry>,
    signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let shutdown = async move {
        signal.await;
        info!("Closing connections...");
        registry.close_connections().await;
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")
}
