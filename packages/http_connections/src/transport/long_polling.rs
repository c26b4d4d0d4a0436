//! Long Polling: each GET drains whatever the application has produced.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use tracing::{debug, warn};

use crate::application::ConnectionHandler;
use crate::connection::{ConnectionContext, LongPollActivation, TransportSession};
use crate::error::DispatchError;
use crate::metrics::ConnectionStopStatus;
use crate::pipe::PipeError;
use crate::registry::ConnectionRegistry;
use crate::transport::apply_no_cache_headers;

const OCTET_STREAM: &str = "application/octet-stream";
const TEXT_PLAIN: &str = "text/plain";

#[derive(Debug)]
enum PollOutcome {
    Data(Bytes),
    TimedOut,
    /// A newer poll took the connection over.
    Superseded,
    /// The application finished its output.
    Completed,
    /// The connection is being disposed.
    Closed,
    Failed(PipeError),
}

/// Serve one poll request for `connection`.
pub(crate) async fn handle_poll(
    registry: &ConnectionRegistry,
    connection: &Arc<ConnectionContext>,
    handler: &Arc<dyn ConnectionHandler>,
    poll_timeout: Duration,
) -> Result<Response, DispatchError> {
    let session = match connection.activate_long_polling(handler).await? {
        LongPollActivation::Primed => {
            return Ok(poll_response(StatusCode::OK, OCTET_STREAM, Body::empty()));
        }
        LongPollActivation::Poll(session) => session,
    };

    match wait_for_output(&session, poll_timeout).await {
        PollOutcome::Data(chunk) => {
            // The session stays held until the body has been written out.
            let body = Body::from_stream(PollBody {
                chunk: Some(chunk),
                _session: session,
            });
            Ok(poll_response(StatusCode::OK, OCTET_STREAM, body))
        }
        PollOutcome::TimedOut => {
            drop(session);
            Ok(poll_response(StatusCode::OK, TEXT_PLAIN, Body::empty()))
        }
        PollOutcome::Superseded => {
            debug!(connection_id = %connection.id(), "poll superseded");
            drop(session);
            Ok(poll_response(StatusCode::NO_CONTENT, TEXT_PLAIN, Body::empty()))
        }
        PollOutcome::Closed => {
            drop(session);
            Ok(poll_response(StatusCode::NO_CONTENT, TEXT_PLAIN, Body::empty()))
        }
        PollOutcome::Completed => {
            drop(session);
            registry
                .dispose_and_remove(connection, false, ConnectionStopStatus::NormalClosure)
                .await;
            Ok(poll_response(StatusCode::NO_CONTENT, TEXT_PLAIN, Body::empty()))
        }
        PollOutcome::Failed(err) => {
            warn!(connection_id = %connection.id(), error = %err, "long polling request failed");
            drop(session);
            registry
                .dispose_and_remove(connection, false, ConnectionStopStatus::NormalClosure)
                .await;
            Ok(poll_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                TEXT_PLAIN,
                Body::empty(),
            ))
        }
    }
}

async fn wait_for_output(session: &TransportSession, poll_timeout: Duration) -> PollOutcome {
    let context = session.context();
    tokio::select! {
        biased;
        result = context.transport().input.read() => match result {
            Ok(read) if !read.buffer.is_empty() => PollOutcome::Data(read.buffer),
            Ok(read) if read.is_completed => PollOutcome::Completed,
            Ok(_) | Err(PipeError::ReaderCompleted) => PollOutcome::Closed,
            Err(err) => PollOutcome::Failed(err),
        },
        _ = session.superseded() => PollOutcome::Superseded,
        _ = context.closed().cancelled() => PollOutcome::Closed,
        _ = tokio::time::sleep(poll_timeout) => PollOutcome::TimedOut,
    }
}

fn poll_response(status: StatusCode, content_type: &'static str, body: Body) -> Response {
    let mut response = (status, [(header::CONTENT_TYPE, content_type)], body).into_response();
    apply_no_cache_headers(response.headers_mut());
    response
}

/// Single-chunk body that owns the poll's session.
struct PollBody {
    chunk: Option<Bytes>,
    _session: TransportSession,
}

impl Stream for PollBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.chunk.take().map(Ok))
    }
}
