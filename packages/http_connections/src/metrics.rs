//! Connection lifecycle metrics
//!
//! Counters are updated by the registry as connections start and stop. Every
//! stop is also emitted as a structured `tracing` event tagged with the
//! transport and the closure reason.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

use crate::transport::TransportType;

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStopStatus {
    NormalClosure,
    Timeout,
    AppShutdown,
    AuthenticationExpired,
}

impl fmt::Display for ConnectionStopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NormalClosure => "normal_closure",
            Self::Timeout => "timeout",
            Self::AppShutdown => "app_shutdown",
            Self::AuthenticationExpired => "authentication_expired",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    /// Connections currently in the registry
    pub current_connections: AtomicU64,
    /// Connections created since start
    pub total_connections: AtomicU64,
    pub connections_stopped: AtomicU64,

    // Stops by transport; connections that never picked one are not counted here
    pub websockets_stopped: AtomicU64,
    pub server_sent_events_stopped: AtomicU64,
    pub long_polling_stopped: AtomicU64,

    // Stops by reason
    pub normal_closures: AtomicU64,
    pub timeouts: AtomicU64,
    pub app_shutdowns: AtomicU64,
    pub authentication_expirations: AtomicU64,

    /// Sum of connection lifetimes in milliseconds
    pub total_duration_ms: AtomicU64,

    start_time: Option<Instant>,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_started(&self) {
        self.current_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_stopped(
        &self,
        transport: Option<TransportType>,
        status: ConnectionStopStatus,
        duration: Duration,
    ) {
        self.current_connections.fetch_sub(1, Ordering::Relaxed);
        self.connections_stopped.fetch_add(1, Ordering::Relaxed);

        let by_transport = match transport {
            Some(TransportType::WebSockets) => Some(&self.websockets_stopped),
            Some(TransportType::ServerSentEvents) => Some(&self.server_sent_events_stopped),
            Some(TransportType::LongPolling) => Some(&self.long_polling_stopped),
            None => None,
        };
        if let Some(counter) = by_transport {
            counter.fetch_add(1, Ordering::Relaxed);
        }

        let by_reason = match status {
            ConnectionStopStatus::NormalClosure => &self.normal_closures,
            ConnectionStopStatus::Timeout => &self.timeouts,
            ConnectionStopStatus::AppShutdown => &self.app_shutdowns,
            ConnectionStopStatus::AuthenticationExpired => &self.authentication_expirations,
        };
        by_reason.fetch_add(1, Ordering::Relaxed);

        let duration_ms = duration.as_millis() as u64;
        self.total_duration_ms
            .fetch_add(duration_ms, Ordering::Relaxed);

        let transport_name = transport.map_or_else(|| "none".to_string(), |t| t.to_string());
        info!(
            transport = %transport_name,
            reason = %status,
            duration_ms,
            "connection stopped"
        );
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionCounts {
                current: self.current_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                stopped: self.connections_stopped.load(Ordering::Relaxed),
                total_duration_ms: self.total_duration_ms.load(Ordering::Relaxed),
            },
            transports: TransportCounts {
                websockets: self.websockets_stopped.load(Ordering::Relaxed),
                server_sent_events: self.server_sent_events_stopped.load(Ordering::Relaxed),
                long_polling: self.long_polling_stopped.load(Ordering::Relaxed),
            },
            stop_reasons: StopReasonCounts {
                normal_closure: self.normal_closures.load(Ordering::Relaxed),
                timeout: self.timeouts.load(Ordering::Relaxed),
                app_shutdown: self.app_shutdowns.load(Ordering::Relaxed),
                authentication_expired: self.authentication_expirations.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionCounts,
    pub transports: TransportCounts,
    pub stop_reasons: StopReasonCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionCounts {
    pub current: u64,
    pub total: u64,
    pub stopped: u64,
    pub total_duration_ms: u64,
}

/// Stopped connections per transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportCounts {
    pub websockets: u64,
    pub server_sent_events: u64,
    pub long_polling: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopReasonCounts {
    pub normal_closure: u64,
    pub timeout: u64,
    pub app_shutdown: u64,
    pub authentication_expired: u64,
}
