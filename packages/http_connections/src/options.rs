//! Runtime options for the connection endpoint and registry.

use std::time::Duration;

use crate::pipe::{DEFAULT_MAX_BUFFER_SIZE, PipeOptions};
use crate::transport::HttpTransports;

/// Endpoint behaviour, shared by every connection it creates.
#[derive(Clone, Debug)]
pub struct HttpConnectionOptions {
    /// Transports offered during negotiation and accepted on requests.
    pub transports: HttpTransports,
    /// Pause threshold for client → application bytes (0 = unbounded).
    pub transport_max_buffer_size: usize,
    /// Pause threshold for application → client bytes (0 = unbounded).
    pub application_max_buffer_size: usize,
    pub long_polling: LongPollingOptions,
    pub websockets: WebSocketOptions,
    /// How long a single send to the client may take before the transport is closed.
    pub transport_send_timeout: Duration,
    /// Lowest negotiate version the server accepts.
    pub minimum_protocol_version: u32,
    pub close_on_authentication_expiration: bool,
    pub allow_stateful_reconnects: bool,
}

impl Default for HttpConnectionOptions {
    fn default() -> Self {
        Self {
            transports: HttpTransports::ALL,
            transport_max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            application_max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            long_polling: LongPollingOptions::default(),
            websockets: WebSocketOptions::default(),
            transport_send_timeout: Duration::from_secs(10),
            minimum_protocol_version: 0,
            close_on_authentication_expiration: false,
            allow_stateful_reconnects: false,
        }
    }
}

impl HttpConnectionOptions {
    pub fn transport_pipe_options(&self) -> PipeOptions {
        PipeOptions::with_max_buffer_size(self.transport_max_buffer_size)
    }

    pub fn application_pipe_options(&self) -> PipeOptions {
        PipeOptions::with_max_buffer_size(self.application_max_buffer_size)
    }
}

#[derive(Clone, Debug)]
pub struct LongPollingOptions {
    pub poll_timeout: Duration,
}

impl Default for LongPollingOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WebSocketOptions {
    /// Grace period for the other loop once either side started closing.
    pub close_timeout: Duration,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// Registry-wide lifecycle settings.
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// Idle time after which an inactive connection is reaped by the sweep.
    pub disconnect_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            disconnect_timeout: Duration::from_secs(15),
        }
    }
}
