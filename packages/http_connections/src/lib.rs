//! One logical, bidirectional byte stream per client, carried over whichever
//! of WebSockets, Server-Sent Events or Long Polling the client can use.
//!
//! Mount [`HttpConnectionDispatcher::router`] under an endpoint path and hand
//! it a [`ConnectionHandler`]; the handler sees every connection as a pair of
//! pipes regardless of transport.

pub mod application;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod negotiate;
pub mod options;
pub mod pipe;
pub mod registry;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use application::{ApplicationConnection, ConnectionHandler};
pub use connection::{ConnectionContext, ConnectionId, ConnectionStatus, ConnectionToken};
pub use dispatcher::{AuthorizationDecision, ConnectionAuthorization, HttpConnectionDispatcher};
pub use error::{ConnectionError, DispatchError};
pub use metrics::{ConnectionMetrics, ConnectionStopStatus, MetricsSnapshot};
pub use negotiate::{NegotiateResponse, PROTOCOL_VERSION};
pub use options::{ConnectionOptions, HttpConnectionOptions, LongPollingOptions, WebSocketOptions};
pub use pipe::{DuplexPipe, PipeError, PipeOptions, PipeReader, PipeWriter};
pub use registry::ConnectionRegistry;
pub use transport::{HttpTransports, TransferFormat, TransportType};
