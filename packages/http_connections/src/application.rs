//! The seam between the connection layer and application code.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionContext, ConnectionId};
use crate::pipe::{PipeReader, PipeWriter};
use crate::transport::{TransferFormat, TransportType};

/// Application code run once per connection, for as long as the connection lives.
///
/// Returning ends the connection: `Ok` completes the client stream, `Err` is
/// surfaced to the transport as a failure. Any closure
/// `Fn(ApplicationConnection) -> impl Future<Output = anyhow::Result<()>>` is a handler.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_connected(&self, connection: ApplicationConnection) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> ConnectionHandler for F
where
    F: Fn(ApplicationConnection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn on_connected(&self, connection: ApplicationConnection) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(self(connection))
    }
}

/// The application's handle on a connection.
#[derive(Clone, Debug)]
pub struct ApplicationConnection {
    context: Arc<ConnectionContext>,
}

impl ApplicationConnection {
    pub(crate) fn new(context: Arc<ConnectionContext>) -> Self {
        Self { context }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        self.context.id()
    }

    /// Bytes sent by the client.
    pub fn input(&self) -> &PipeReader {
        &self.context.application().input
    }

    /// Bytes for the client.
    pub fn output(&self) -> &PipeWriter {
        &self.context.application().output
    }

    pub fn transport_type(&self) -> Option<TransportType> {
        self.context.transport_type()
    }

    /// Formats the current transport can carry.
    pub fn supported_formats(&self) -> &'static [TransferFormat] {
        self.transport_type()
            .map(TransportType::transfer_formats)
            .unwrap_or(&[])
    }

    pub fn active_format(&self) -> TransferFormat {
        self.context.active_format()
    }

    /// Frame type used for WebSocket sends.
    pub fn set_active_format(&self, format: TransferFormat) {
        self.context.set_active_format(format);
    }

    /// True for transports whose polling already proves the client is alive.
    pub fn has_inherent_keep_alive(&self) -> bool {
        self.context.has_inherent_keep_alive()
    }

    /// Cancelled once the connection is being torn down.
    pub fn closed(&self) -> CancellationToken {
        self.context.closed().clone()
    }

    /// Cancelled when the server wants the application to finish, e.g. on
    /// authentication expiry.
    pub fn close_requested(&self) -> CancellationToken {
        self.context.close_requested().clone()
    }

    pub fn authentication_expiration(&self) -> Option<DateTime<Utc>> {
        self.context.authentication_expiration()
    }

    pub fn is_stateful_reconnect_enabled(&self) -> bool {
        self.context.is_stateful_reconnect_enabled()
    }

    pub fn disable_reconnect(&self) {
        self.context.disable_reconnect();
    }

    /// Called with the output writer each time a new transport takes the connection over.
    pub fn on_reconnected(&self, callback: impl Fn(PipeWriter) + Send + Sync + 'static) {
        self.context.on_reconnected(callback);
    }

    /// Ask the server to close the connection.
    pub fn abort(&self) {
        self.context.request_close();
        self.context.application().output.complete(None);
    }
}
