//! Server-Sent Events: application output streamed as `data:` events.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, warn};

use crate::application::ConnectionHandler;
use crate::connection::{ConnectionContext, TransportSession};
use crate::error::DispatchError;
use crate::metrics::ConnectionStopStatus;
use crate::pipe::PipeError;
use crate::registry::ConnectionRegistry;
use crate::transport::{TransportType, apply_no_cache_headers};

/// Sent first so that intermediaries flush the response headers.
const PREAMBLE: &[u8] = b":\r\n";

/// Frame one application payload as a single event.
///
/// Each line becomes a `data:` field; a trailing line break does not produce
/// an empty field.
pub fn format_message(payload: &[u8], out: &mut Vec<u8>) {
    let mut lines: Vec<&[u8]> = payload.split(|b| *b == b'\n').collect();
    if lines.len() > 1 && lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    for line in lines {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        out.extend_from_slice(b"data: ");
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

#[derive(Debug)]
enum SseEnd {
    Completed,
    ClientGone,
    SendTimedOut,
    Closed,
    Failed(String),
}

/// Start an event stream for `connection`.
pub(crate) async fn handle_event_stream(
    registry: Arc<ConnectionRegistry>,
    connection: &Arc<ConnectionContext>,
    handler: &Arc<dyn ConnectionHandler>,
) -> Result<Response, DispatchError> {
    let session = connection
        .activate_persistent(TransportType::ServerSentEvents, handler)
        .await?;
    debug!(connection_id = %connection.id(), "established server-sent events connection");

    let (frames_tx, frames_rx) = mpsc::channel(1);
    let abort = CancellationToken::new();
    tokio::spawn(pump(registry, session, frames_tx, abort.clone()));

    let body = Body::from_stream(EventStream {
        frames: frames_rx,
        abort: Box::pin(abort.cancelled_owned()),
        done: false,
    });
    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/event-stream")],
        body,
    )
        .into_response();
    let headers = response.headers_mut();
    apply_no_cache_headers(headers);
    headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("identity"));
    Ok(response)
}

async fn pump(
    registry: Arc<ConnectionRegistry>,
    session: TransportSession,
    frames: mpsc::Sender<Bytes>,
    abort: CancellationToken,
) {
    let context = session.context().clone();
    let end = stream_events(&context, &frames).await;
    debug!(connection_id = %context.id(), outcome = ?end, "event stream ended");

    if matches!(end, SseEnd::SendTimedOut) {
        abort.cancel();
    }
    drop(frames);
    drop(session);

    match end {
        SseEnd::Closed => {}
        SseEnd::Completed | SseEnd::ClientGone => {
            registry
                .dispose_and_remove(&context, true, ConnectionStopStatus::NormalClosure)
                .await;
        }
        SseEnd::SendTimedOut => {
            registry
                .dispose_and_remove(&context, false, ConnectionStopStatus::NormalClosure)
                .await;
        }
        SseEnd::Failed(err) => {
            warn!(connection_id = %context.id(), error = %err, "event stream failed");
            registry
                .dispose_and_remove(&context, false, ConnectionStopStatus::NormalClosure)
                .await;
        }
    }
}

async fn stream_events(context: &ConnectionContext, frames: &mpsc::Sender<Bytes>) -> SseEnd {
    if frames.send(Bytes::from_static(PREAMBLE)).await.is_err() {
        return SseEnd::ClientGone;
    }

    loop {
        let result = tokio::select! {
            biased;
            _ = context.closed().cancelled() => return SseEnd::Closed,
            _ = frames.closed() => return SseEnd::ClientGone,
            result = context.transport().input.read() => result,
        };

        let read = match result {
            Ok(read) => read,
            Err(PipeError::Faulted(err)) => return SseEnd::Failed(err),
            Err(_) => return SseEnd::Closed,
        };

        if !read.buffer.is_empty() {
            let mut frame = Vec::with_capacity(read.buffer.len() + 16);
            format_message(&read.buffer, &mut frame);

            let send = context.start_send();
            tokio::select! {
                biased;
                _ = send.timed_out() => return SseEnd::SendTimedOut,
                sent = frames.send(Bytes::from(frame)) => {
                    if sent.is_err() {
                        return SseEnd::ClientGone;
                    }
                }
            }
        }

        if read.is_completed {
            return SseEnd::Completed;
        } else if read.is_canceled && read.buffer.is_empty() {
            return SseEnd::Closed;
        }
    }
}

/// Response body fed by the pump. Aborting yields an error so the client sees
/// a broken stream instead of a clean end.
struct EventStream {
    frames: mpsc::Receiver<Bytes>,
    abort: Pin<Box<WaitForCancellationFutureOwned>>,
    done: bool,
}

impl Stream for EventStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        if self.abort.as_mut().poll(cx).is_ready() {
            self.done = true;
            return Poll::Ready(Some(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "send to client timed out",
            ))));
        }
        self.frames.poll_recv(cx).map(|frame| frame.map(Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::time::Instant;

    use crate::connection::ConnectionStatus;
    use crate::options::{ConnectionOptions, HttpConnectionOptions};
    use crate::test_helpers::{never_ending_handler, test_registry, wait_until_removed};

    fn formatted(payload: &[u8]) -> String {
        let mut out = Vec::new();
        format_message(payload, &mut out);
        String::from_utf8(out).unwrap()
    }

    // ── framing ─────────────────────────────────────────────────────────

    #[test]
    fn single_line_message() {
        assert_eq!(formatted(b"Hello World"), "data: Hello World\r\n\r\n");
    }

    #[test]
    fn multi_line_messages_split_on_line_feeds() {
        assert_eq!(
            formatted(b"Hello\nWorld"),
            "data: Hello\r\ndata: World\r\n\r\n"
        );
        assert_eq!(
            formatted(b"Hello\r\nWorld\r\n"),
            "data: Hello\r\ndata: World\r\n\r\n"
        );
    }

    #[test]
    fn trailing_line_feed_adds_no_empty_field() {
        assert_eq!(formatted(b"Hello World\n"), "data: Hello World\r\n\r\n");
        assert_eq!(formatted(b"Hello\n\nWorld"), "data: Hello\r\ndata: \r\ndata: World\r\n\r\n");
    }

    #[test]
    fn lone_carriage_returns_are_kept() {
        assert_eq!(formatted(b"a\rb"), "data: a\rb\r\n\r\n");
    }

    // ── streaming ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn stream_starts_with_preamble_and_carries_events() {
        let registry = test_registry(ConnectionOptions::default());
        let connection = registry.create(&HttpConnectionOptions::default(), 1, false).await;

        let response = handle_event_stream(registry.clone(), &connection, &never_ending_handler())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()[header::CONTENT_ENCODING], "identity");
        assert_eq!(connection.status(), ConnectionStatus::Active);

        let mut body = response.into_body().into_data_stream();
        assert_eq!(&body.next().await.unwrap().unwrap()[..], PREAMBLE);

        connection.application().output.write("Hi\nthere").await.unwrap();
        assert_eq!(
            &body.next().await.unwrap().unwrap()[..],
            b"data: Hi\r\ndata: there\r\n\r\n"
        );

        connection.application().output.complete(None);
        assert!(body.next().await.is_none());
        wait_until_removed(&registry, connection.token().as_str()).await;
    }

    #[tokio::test]
    async fn second_stream_conflicts() {
        let registry = test_registry(ConnectionOptions::default());
        let connection = registry.create(&HttpConnectionOptions::default(), 1, false).await;
        let handler = never_ending_handler();

        let _first = handle_event_stream(registry.clone(), &connection, &handler)
            .await
            .unwrap();
        let err = handle_event_stream(registry.clone(), &connection, &handler)
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::AlreadyActive);
    }

    #[tokio::test]
    async fn dropped_body_disposes_the_connection() {
        let registry = test_registry(ConnectionOptions::default());
        let connection = registry.create(&HttpConnectionOptions::default(), 1, false).await;

        let response = handle_event_stream(registry.clone(), &connection, &never_ending_handler())
            .await
            .unwrap();
        drop(response);

        wait_until_removed(&registry, connection.token().as_str()).await;
        assert_eq!(connection.status(), ConnectionStatus::Disposed);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_send_aborts_the_stream() {
        let registry = test_registry(ConnectionOptions::default());
        let options = HttpConnectionOptions {
            transport_send_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let connection = registry.create(&options, 1, false).await;

        let response = handle_event_stream(registry.clone(), &connection, &never_ending_handler())
            .await
            .unwrap();
        // Nobody reads the body: the preamble fills the channel and the next
        // send stalls.
        connection.application().output.write("stuck").await.unwrap();

        let mut cancelled = false;
        for _ in 0..20 {
            tokio::time::advance(Duration::from_millis(500)).await;
            if connection.try_cancel_send(Instant::now()) {
                cancelled = true;
                break;
            }
        }
        assert!(cancelled);

        let mut body = response.into_body().into_data_stream();
        let mut saw_error = false;
        while let Some(frame) = body.next().await {
            if frame.is_err() {
                saw_error = true;
                break;
            }
        }
        assert!(saw_error);
        wait_until_removed(&registry, connection.token().as_str()).await;
    }
}
