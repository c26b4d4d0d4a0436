//! Connection registry
//!
//! Indexes live connections by token, reaps idle ones, and records lifecycle
//! metrics as connections leave.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionContext, ConnectionStatus, ConnectionToken, new_identity};
use crate::metrics::{ConnectionMetrics, ConnectionStopStatus};
use crate::options::{ConnectionOptions, HttpConnectionOptions};

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionToken, Arc<ConnectionContext>>>,
    options: ConnectionOptions,
    metrics: Arc<ConnectionMetrics>,
}

impl ConnectionRegistry {
    pub fn new(options: ConnectionOptions, metrics: Arc<ConnectionMetrics>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            options,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<ConnectionMetrics> {
        &self.metrics
    }

    /// Register a new `Inactive` connection.
    pub async fn create(
        &self,
        options: &HttpConnectionOptions,
        negotiate_version: u32,
        use_stateful_reconnect: bool,
    ) -> Arc<ConnectionContext> {
        let (id, token) = new_identity(negotiate_version);
        let connection = ConnectionContext::new(id, token.clone(), options, use_stateful_reconnect);

        self.connections.write().await.insert(token, connection.clone());
        self.metrics.connection_started();
        debug!(connection_id = %connection.id(), negotiate_version, "created connection");
        connection
    }

    pub async fn lookup(&self, token: &str) -> Option<Arc<ConnectionContext>> {
        self.connections.read().await.get(token).cloned()
    }

    /// Drop the connection from the index without disposing it.
    ///
    /// Stop metrics use the reason claimed first on the connection, if any.
    pub async fn remove(&self, connection: &ConnectionContext, status: ConnectionStopStatus) -> bool {
        let status = connection.claim_stop_status(status);
        let removed = self
            .connections
            .write()
            .await
            .remove(connection.token().as_str())
            .is_some();
        if removed {
            self.metrics
                .connection_stopped(connection.transport_type(), status, connection.age());
        }
        removed
    }

    /// Dispose the connection, then remove it.
    pub async fn dispose_and_remove(
        &self,
        connection: &Arc<ConnectionContext>,
        close_gracefully: bool,
        status: ConnectionStopStatus,
    ) {
        let status = connection.claim_stop_status(status);
        if let Err(e) = connection.dispose(close_gracefully).await {
            warn!(connection_id = %connection.id(), error = %e, "connection ended with an error");
        }
        self.remove(connection, status).await;
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    async fn snapshot(&self) -> Vec<Arc<ConnectionContext>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// One garbage-collection pass. Returns how many connections were sent to disposal.
    ///
    /// Idle inactive connections are disposed, expired send deadlines are
    /// cancelled, and connections whose authentication expired are closed.
    pub async fn sweep(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let wall_clock = Utc::now();
        let mut reaped = 0;

        for connection in self.snapshot().await {
            // Already draining; its disposer removes it
            if connection.status() == ConnectionStatus::Disposed {
                continue;
            }

            let idle = connection
                .idle_since()
                .is_some_and(|since| now.saturating_duration_since(since) > self.options.disconnect_timeout);

            let status = if idle {
                info!(connection_id = %connection.id(), "connection timed out");
                Some(ConnectionStopStatus::Timeout)
            } else if connection.should_close_for_expiration(wall_clock) {
                info!(connection_id = %connection.id(), "authentication expired, closing connection");
                connection.request_close();
                Some(ConnectionStopStatus::AuthenticationExpired)
            } else {
                connection.try_cancel_send(now);
                None
            };

            if let Some(status) = status {
                reaped += 1;
                connection.claim_stop_status(status);
                let registry = self.clone();
                tokio::spawn(async move {
                    registry.dispose_and_remove(&connection, false, status).await;
                });
            }
        }

        reaped
    }

    /// Dispose every connection, e.g. on server shutdown.
    pub async fn close_connections(&self) {
        let connections = self.snapshot().await;
        info!("Closing {} connections", connections.len());
        let closing = connections.iter().map(|connection| {
            self.dispose_and_remove(connection, false, ConnectionStopStatus::AppShutdown)
        });
        futures::future::join_all(closing).await;
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.sweep().await;
                    }
                }
            }
            debug!("connection sweeper stopped");
        })
    }
}
