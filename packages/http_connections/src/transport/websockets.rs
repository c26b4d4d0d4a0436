//! WebSockets: full-duplex framing between the socket and the connection pipes.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::WebSocketUpgrade;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::application::ConnectionHandler;
use crate::connection::{ConnectionContext, TransportSession};
use crate::error::DispatchError;
use crate::metrics::ConnectionStopStatus;
use crate::pipe::PipeError;
use crate::registry::ConnectionRegistry;
use crate::transport::{TransferFormat, TransportType};

#[derive(Debug, PartialEq, Eq)]
enum WebSocketEnd {
    /// The client sent a close frame.
    ClientClosed,
    /// The socket went away without a close handshake.
    Dropped,
    /// A reconnecting socket took the connection over.
    Superseded,
    /// The application finished its output.
    Completed,
    Failed(String),
}

enum ReceiveEnd {
    ClientClosed,
    Dropped,
    /// The application stopped accepting input.
    InputClosed,
}

enum SendEnd {
    Completed,
    SocketGone,
    Failed(String),
}

/// Claim `connection` for a WebSocket and upgrade the request.
///
/// The session is taken before the upgrade; if the upgrade never happens
/// the callback is dropped and the connection is released.
pub(crate) async fn handle_websocket(
    registry: Arc<ConnectionRegistry>,
    connection: &Arc<ConnectionContext>,
    handler: &Arc<dyn ConnectionHandler>,
    upgrade: WebSocketUpgrade,
    close_timeout: Duration,
) -> Result<Response, DispatchError> {
    let session = connection
        .activate_persistent(TransportType::WebSockets, handler)
        .await?;
    debug!(connection_id = %connection.id(), "established websocket connection");

    Ok(upgrade.on_upgrade(move |socket| async move {
        let end = process_socket(socket, &session, close_timeout).await;
        let context = session.context().clone();
        drop(session);
        finish(&registry, &context, end).await;
    }))
}

async fn finish(registry: &ConnectionRegistry, context: &Arc<ConnectionContext>, end: WebSocketEnd) {
    debug!(connection_id = %context.id(), outcome = ?end, "websocket ended");
    match end {
        WebSocketEnd::Superseded => {}
        WebSocketEnd::Dropped
            if context.is_stateful_reconnect_enabled() && !context.is_application_completed() =>
        {
            debug!(connection_id = %context.id(), "websocket dropped, waiting for reconnect");
        }
        WebSocketEnd::Failed(err) => {
            warn!(connection_id = %context.id(), error = %err, "websocket failed");
            registry
                .dispose_and_remove(context, false, ConnectionStopStatus::NormalClosure)
                .await;
        }
        _ => {
            registry
                .dispose_and_remove(context, true, ConnectionStopStatus::NormalClosure)
                .await;
        }
    }
}

async fn process_socket(socket: WebSocket, session: &TransportSession, close_timeout: Duration) -> WebSocketEnd {
    let context = session.context();
    let (mut sender, mut receiver) = socket.split();

    let receiving = receive_loop(&mut receiver, context);
    let sending = send_loop(&mut sender, context);
    tokio::pin!(receiving, sending);

    tokio::select! {
        biased;
        _ = session.superseded() => WebSocketEnd::Superseded,
        end = &mut sending => {
            // Let the client acknowledge our close frame
            if tokio::time::timeout(close_timeout, &mut receiving).await.is_err() {
                debug!(connection_id = %context.id(), "client did not close in time");
            }
            match end {
                SendEnd::Completed => WebSocketEnd::Completed,
                SendEnd::SocketGone => WebSocketEnd::Dropped,
                SendEnd::Failed(err) => WebSocketEnd::Failed(err),
            }
        }
        end = &mut receiving => match end {
            ReceiveEnd::Dropped => WebSocketEnd::Dropped,
            ReceiveEnd::ClientClosed | ReceiveEnd::InputClosed => {
                // Tell the application, then give it a chance to drain its output
                context.transport().output.complete(None);
                match tokio::time::timeout(close_timeout, &mut sending).await {
                    Ok(SendEnd::Failed(err)) => WebSocketEnd::Failed(err),
                    Ok(_) => WebSocketEnd::ClientClosed,
                    Err(_) => {
                        debug!(connection_id = %context.id(), "application did not finish in time");
                        WebSocketEnd::ClientClosed
                    }
                }
            }
        },
    }
}

async fn receive_loop(receiver: &mut SplitStream<WebSocket>, context: &ConnectionContext) -> ReceiveEnd {
    while let Some(message) = receiver.next().await {
        let payload = match message {
            Ok(Message::Text(text)) => Bytes::from(text.as_str().to_owned()),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => return ReceiveEnd::ClientClosed,
            Ok(_) => continue,
            Err(err) => {
                debug!(connection_id = %context.id(), error = %err, "websocket receive failed");
                return ReceiveEnd::Dropped;
            }
        };

        let _write = context.write_lock().lock().await;
        match context.transport().output.write(payload).await {
            Ok(flush) if flush.is_completed || flush.is_canceled => return ReceiveEnd::InputClosed,
            Ok(_) => {}
            Err(_) => return ReceiveEnd::InputClosed,
        }
    }
    ReceiveEnd::Dropped
}

async fn send_loop(sender: &mut SplitSink<WebSocket, Message>, context: &ConnectionContext) -> SendEnd {
    let mut text = TextFramer::default();
    loop {
        let result = tokio::select! {
            biased;
            _ = context.closed().cancelled() => {
                close(sender, close_code::NORMAL).await;
                return SendEnd::Completed;
            }
            result = context.transport().input.read() => result,
        };

        let read = match result {
            Ok(read) => read,
            Err(PipeError::Faulted(err)) => {
                close(sender, close_code::ERROR).await;
                return SendEnd::Failed(err);
            }
            Err(_) => {
                close(sender, close_code::NORMAL).await;
                return SendEnd::Completed;
            }
        };

        let message = match context.active_format() {
            TransferFormat::Binary if !read.buffer.is_empty() => Some(Message::Binary(read.buffer)),
            TransferFormat::Binary => None,
            TransferFormat::Text => match text.push(&read.buffer) {
                Ok(frame) => frame.map(|frame| Message::Text(frame.into())),
                Err(err) => {
                    close(sender, close_code::ERROR).await;
                    return SendEnd::Failed(err.to_string());
                }
            },
        };

        if let Some(message) = message {
            let send = context.start_send();
            let sent = tokio::select! {
                biased;
                _ = send.timed_out() => false,
                sent = sender.send(message) => sent.is_ok(),
            };
            if !sent {
                return SendEnd::SocketGone;
            }
        }

        if read.is_completed {
            if text.has_partial() {
                close(sender, close_code::ERROR).await;
                return SendEnd::Failed(InvalidText.to_string());
            }
            close(sender, close_code::NORMAL).await;
            return SendEnd::Completed;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("text frame payload is not valid UTF-8")]
struct InvalidText;

/// Cuts application output into text frames on character boundaries.
///
/// A character split across pipe reads is held back until its remaining
/// bytes arrive.
#[derive(Debug, Default)]
struct TextFramer {
    pending: Vec<u8>,
}

impl TextFramer {
    fn push(&mut self, chunk: &[u8]) -> Result<Option<String>, InvalidText> {
        self.pending.extend_from_slice(chunk);
        let complete = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(err) if err.error_len().is_some() => return Err(InvalidText),
            Err(err) => err.valid_up_to(),
        };
        if complete == 0 {
            return Ok(None);
        }

        let rest = self.pending.split_off(complete);
        let frame = std::mem::replace(&mut self.pending, rest);
        String::from_utf8(frame).map(Some).map_err(|_| InvalidText)
    }

    fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }
}

async fn close(sender: &mut SplitSink<WebSocket, Message>, code: u16) {
    let frame = CloseFrame {
        code,
        reason: Utf8Bytes::from_static(""),
    };
    // The client may already be gone
    let _ = sender.send(Message::Close(Some(frame))).await;
}
