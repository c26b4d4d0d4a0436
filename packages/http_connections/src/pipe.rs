//! Bounded in-memory byte pipes.
//!
//! A [`DuplexPipe`] pair connects a transport to the application: bytes the
//! client sends flow transport → application, bytes the application produces
//! flow application → transport. Each direction is flow-controlled on its own:
//! a writer whose flush finds the buffer at or above the pause threshold waits
//! until the reader has drained it below the resume threshold.
//!
//! Reads are cancel-safe. Buffered bytes are only taken out of the pipe when a
//! read completes, so a read dropped inside `tokio::select!` loses nothing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::body::Bytes;
use tokio::sync::Notify;

/// Default pause threshold for both directions of a connection.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 64 * 1024;

/// Flow-control thresholds for one pipe direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipeOptions {
    /// Buffered byte count at which flushes start waiting. Zero disables backpressure.
    pub pause_writer_threshold: usize,
    /// Buffered byte count below which a waiting flush resumes.
    pub resume_writer_threshold: usize,
}

impl PipeOptions {
    pub fn new(pause_writer_threshold: usize, resume_writer_threshold: usize) -> Self {
        Self {
            pause_writer_threshold,
            resume_writer_threshold: resume_writer_threshold.min(pause_writer_threshold),
        }
    }

    /// Pause at `max_buffer_size`, resume at half of it.
    pub fn with_max_buffer_size(max_buffer_size: usize) -> Self {
        Self::new(max_buffer_size, max_buffer_size / 2)
    }

    pub fn unbounded() -> Self {
        Self::new(0, 0)
    }

    fn is_unbounded(&self) -> bool {
        self.pause_writer_threshold == 0
    }
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self::with_max_buffer_size(DEFAULT_MAX_BUFFER_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipeError {
    #[error("writing is not allowed after the writer was completed")]
    WriterCompleted,
    #[error("reading is not allowed after the reader was completed")]
    ReaderCompleted,
    #[error("pipe writer failed: {0}")]
    Faulted(String),
}

/// Outcome of a read.
#[derive(Debug, Default, Clone)]
pub struct ReadResult {
    pub buffer: Bytes,
    /// The writer completed and every buffered byte has been handed out.
    pub is_completed: bool,
    /// The read was released by [`PipeReader::cancel_pending_read`].
    pub is_canceled: bool,
}

/// Outcome of a flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    /// The reader completed; further writes are discarded.
    pub is_completed: bool,
    /// The flush was released by [`PipeWriter::cancel_pending_flush`].
    pub is_canceled: bool,
}

#[derive(Debug, Default)]
struct PipeState {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    /// `Some(None)` once the writer completed cleanly, `Some(Some(_))` when it failed.
    writer_completion: Option<Option<String>>,
    reader_completed: bool,
    read_canceled: bool,
    flush_canceled: bool,
}

impl PipeState {
    fn take(&mut self, limit: usize) -> Bytes {
        if limit >= self.buffered && self.chunks.len() == 1 {
            self.buffered = 0;
            return self.chunks.pop_front().unwrap_or_default();
        }

        let wanted = limit.min(self.buffered);
        let mut out = Vec::with_capacity(wanted);
        while out.len() < wanted {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let remaining = wanted - out.len();
            if front.len() <= remaining {
                out.extend_from_slice(front);
                self.chunks.pop_front();
            } else {
                out.extend_from_slice(&front.split_to(remaining));
            }
        }
        self.buffered -= out.len();
        Bytes::from(out)
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<PipeState>,
    options: PipeOptions,
    readable: Notify,
    writable: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a single pipe direction.
pub fn pipe(options: PipeOptions) -> (PipeReader, PipeWriter) {
    let shared = Arc::new(Shared {
        state: Mutex::new(PipeState::default()),
        options,
        readable: Notify::new(),
        writable: Notify::new(),
    });
    (
        PipeReader {
            shared: shared.clone(),
        },
        PipeWriter { shared },
    )
}

/// Consuming end of a pipe.
#[derive(Clone, Debug)]
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Wait for data, completion, or cancellation, taking everything buffered.
    pub async fn read(&self) -> Result<ReadResult, PipeError> {
        self.read_max(usize::MAX).await
    }

    /// Like [`read`](Self::read), but hands out at most `limit` bytes.
    pub async fn read_max(&self, limit: usize) -> Result<ReadResult, PipeError> {
        loop {
            if let Some(result) = self.try_read_max(limit) {
                return result;
            }
            self.shared.readable.notified().await;
        }
    }

    /// Non-blocking read; `None` when nothing is available yet.
    pub fn try_read(&self) -> Option<Result<ReadResult, PipeError>> {
        self.try_read_max(usize::MAX)
    }

    fn try_read_max(&self, limit: usize) -> Option<Result<ReadResult, PipeError>> {
        let mut state = self.shared.state();
        if state.reader_completed {
            return Some(Err(PipeError::ReaderCompleted));
        }

        let canceled = std::mem::take(&mut state.read_canceled);
        if state.buffered > 0 && limit > 0 {
            let buffer = state.take(limit);
            let is_completed = state.buffered == 0 && state.writer_completion == Some(None);
            drop(state);
            self.shared.writable.notify_one();
            return Some(Ok(ReadResult {
                buffer,
                is_completed,
                is_canceled: canceled,
            }));
        }

        match &state.writer_completion {
            Some(Some(error)) => Some(Err(PipeError::Faulted(error.clone()))),
            Some(None) => Some(Ok(ReadResult {
                is_completed: true,
                is_canceled: canceled,
                ..Default::default()
            })),
            None if canceled => Some(Ok(ReadResult {
                is_canceled: true,
                ..Default::default()
            })),
            None => None,
        }
    }

    /// Release the current (or next) read with `is_canceled` set.
    pub fn cancel_pending_read(&self) {
        self.shared.state().read_canceled = true;
        self.shared.readable.notify_one();
    }

    /// Stop reading. Buffered bytes are dropped and pending flushes complete.
    pub fn complete(&self) {
        {
            let mut state = self.shared.state();
            state.reader_completed = true;
            state.chunks.clear();
            state.buffered = 0;
        }
        self.shared.writable.notify_one();
    }

    pub fn buffered_len(&self) -> usize {
        self.shared.state().buffered
    }
}

/// Producing end of a pipe.
#[derive(Clone, Debug)]
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Append `data` and flush, waiting while the reader is behind.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<FlushResult, PipeError> {
        self.push(data.into())?;
        self.flush().await
    }

    /// Append without waiting for backpressure.
    pub fn push(&self, data: Bytes) -> Result<(), PipeError> {
        {
            let mut state = self.shared.state();
            if state.writer_completion.is_some() {
                return Err(PipeError::WriterCompleted);
            }
            if state.reader_completed || data.is_empty() {
                return Ok(());
            }
            state.buffered += data.len();
            state.chunks.push_back(data);
        }
        self.shared.readable.notify_one();
        Ok(())
    }

    /// Wait until the buffer is below the pause threshold (or, once paused,
    /// below the resume threshold).
    pub async fn flush(&self) -> Result<FlushResult, PipeError> {
        let options = self.shared.options;
        let mut paused = false;
        loop {
            {
                let mut state = self.shared.state();
                if std::mem::take(&mut state.flush_canceled) {
                    return Ok(FlushResult {
                        is_canceled: true,
                        ..Default::default()
                    });
                }
                if state.reader_completed {
                    return Ok(FlushResult {
                        is_completed: true,
                        ..Default::default()
                    });
                }
                if state.writer_completion.is_some() {
                    return Err(PipeError::WriterCompleted);
                }
                let threshold = if paused {
                    options.resume_writer_threshold
                } else {
                    options.pause_writer_threshold
                };
                if options.is_unbounded() || state.buffered < threshold {
                    return Ok(FlushResult::default());
                }
                if paused && threshold == 0 && state.buffered == 0 {
                    return Ok(FlushResult::default());
                }
            }
            paused = true;
            self.shared.writable.notified().await;
        }
    }

    /// Release the current (or next) flush with `is_canceled` set.
    pub fn cancel_pending_flush(&self) {
        self.shared.state().flush_canceled = true;
        self.shared.writable.notify_one();
    }

    /// Signal end of stream. With an error, the reader sees it once the buffer is drained.
    pub fn complete(&self, error: Option<String>) {
        {
            let mut state = self.shared.state();
            if state.writer_completion.is_none() {
                state.writer_completion = Some(error);
            }
        }
        self.shared.readable.notify_one();
        self.shared.writable.notify_one();
    }

    pub fn is_completed(&self) -> bool {
        self.shared.state().writer_completion.is_some()
    }
}

/// One side's view of a duplex pipe: what it reads and what it writes.
#[derive(Clone, Debug)]
pub struct DuplexPipe {
    pub input: PipeReader,
    pub output: PipeWriter,
}

/// Both ends of a duplex pipe.
#[derive(Clone, Debug)]
pub struct DuplexPipePair {
    pub transport: DuplexPipe,
    pub application: DuplexPipe,
}

impl DuplexPipe {
    /// `transport_options` bound client → application bytes,
    /// `application_options` bound application → client bytes.
    pub fn create_pair(
        transport_options: PipeOptions,
        application_options: PipeOptions,
    ) -> DuplexPipePair {
        let (application_input, transport_output) = pipe(transport_options);
        let (transport_input, application_output) = pipe(application_options);
        DuplexPipePair {
            transport: DuplexPipe {
                input: transport_input,
                output: transport_output,
            },
            application: DuplexPipe {
                input: application_input,
                output: application_output,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    // ── backpressure ────────────────────────────────────────────────────

    #[test]
    fn write_pauses_at_threshold_and_resumes_after_drain() {
        let (reader, writer) = pipe(PipeOptions::new(4, 2));

        let mut write = task::spawn(writer.write("Hello"));
        assert_pending!(write.poll());

        let result = reader.try_read().unwrap().unwrap();
        assert_eq!(&result.buffer[..], b"Hello");

        assert!(write.is_woken());
        let flush = assert_ready!(write.poll()).unwrap();
        assert_eq!(flush, FlushResult::default());
    }

    #[test]
    fn paused_writer_waits_for_resume_threshold() {
        let (reader, writer) = pipe(PipeOptions::new(8, 4));

        let mut write = task::spawn(writer.write("EXTRADATA Hi"));
        assert_pending!(write.poll());

        // 12 → 7 is below pause but not below resume
        let first = reader.try_read_max(5).unwrap().unwrap();
        assert_eq!(&first.buffer[..], b"EXTRA");
        assert_pending!(write.poll());

        // 7 → 2 resumes
        let second = reader.try_read_max(5).unwrap().unwrap();
        assert_eq!(&second.buffer[..], b"DATA ");
        assert_ready!(write.poll()).unwrap();

        let rest = reader.try_read().unwrap().unwrap();
        assert_eq!(&rest.buffer[..], b"Hi");
    }

    #[test]
    fn unbounded_pipe_never_pauses() {
        let (reader, writer) = pipe(PipeOptions::unbounded());
        let mut write = task::spawn(writer.write(vec![0u8; 1 << 20]));
        assert_ready!(write.poll()).unwrap();
        assert_eq!(reader.buffered_len(), 1 << 20);
    }

    #[test]
    fn cancel_pending_flush_releases_writer() {
        let (reader, writer) = pipe(PipeOptions::new(4, 2));

        let mut write = task::spawn(writer.write("Hello"));
        assert_pending!(write.poll());

        writer.cancel_pending_flush();
        let flush = assert_ready!(write.poll()).unwrap();
        assert!(flush.is_canceled);

        // The data written before the cancel is still readable
        let result = reader.try_read().unwrap().unwrap();
        assert_eq!(&result.buffer[..], b"Hello");
        assert!(!result.is_canceled);
    }

    #[test]
    fn completed_reader_releases_writer() {
        let (reader, writer) = pipe(PipeOptions::new(4, 2));
        let mut write = task::spawn(writer.write("Hello"));
        assert_pending!(write.poll());

        reader.complete();
        let flush = assert_ready!(write.poll()).unwrap();
        assert!(flush.is_completed);
    }

    // ── completion ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn reader_drains_data_before_completion() {
        let (reader, writer) = pipe(PipeOptions::default());
        writer.write("bytes").await.unwrap();
        writer.complete(None);

        let result = reader.read().await.unwrap();
        assert_eq!(&result.buffer[..], b"bytes");
        assert!(result.is_completed);
    }

    #[tokio::test]
    async fn writer_error_surfaces_after_drain() {
        let (reader, writer) = pipe(PipeOptions::default());
        writer.write("partial").await.unwrap();
        writer.complete(Some("boom".to_string()));

        let result = reader.read().await.unwrap();
        assert_eq!(&result.buffer[..], b"partial");
        assert!(!result.is_completed);

        let err = reader.read().await.unwrap_err();
        assert_eq!(err, PipeError::Faulted("boom".to_string()));
    }

    #[tokio::test]
    async fn write_after_complete_fails() {
        let (_reader, writer) = pipe(PipeOptions::default());
        writer.complete(None);
        assert_eq!(
            writer.write("late").await.unwrap_err(),
            PipeError::WriterCompleted
        );
    }

    #[tokio::test]
    async fn read_after_reader_complete_fails() {
        let (reader, _writer) = pipe(PipeOptions::default());
        reader.complete();
        assert_eq!(reader.read().await.unwrap_err(), PipeError::ReaderCompleted);
    }

    // ── cancellation ────────────────────────────────────────────────────

    #[test]
    fn cancel_pending_read_releases_reader_once() {
        let (reader, writer) = pipe(PipeOptions::default());

        let mut read = task::spawn(reader.read());
        assert_pending!(read.poll());

        reader.cancel_pending_read();
        let result = assert_ready!(read.poll()).unwrap();
        assert!(result.is_canceled);
        assert!(result.buffer.is_empty());

        writer.push(Bytes::from_static(b"next")).unwrap();
        let result = reader.try_read().unwrap().unwrap();
        assert!(!result.is_canceled);
        assert_eq!(&result.buffer[..], b"next");
    }

    #[test]
    fn dropped_read_loses_nothing() {
        let (reader, writer) = pipe(PipeOptions::default());

        let mut read = task::spawn(reader.read());
        assert_pending!(read.poll());
        drop(read);

        writer.push(Bytes::from_static(b"kept")).unwrap();
        let result = reader.try_read().unwrap().unwrap();
        assert_eq!(&result.buffer[..], b"kept");
    }

    #[test]
    fn flush_cancel_does_not_affect_reads() {
        let (reader, writer) = pipe(PipeOptions::default());
        writer.cancel_pending_flush();
        writer.push(Bytes::from_static(b"data")).unwrap();

        let result = reader.try_read().unwrap().unwrap();
        assert!(!result.is_canceled);
        assert_eq!(&result.buffer[..], b"data");
    }

    // ── duplex ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn duplex_pair_crosses_directions() {
        let pair = DuplexPipe::create_pair(PipeOptions::default(), PipeOptions::default());

        pair.transport.output.write("from client").await.unwrap();
        let received = pair.application.input.read().await.unwrap();
        assert_eq!(&received.buffer[..], b"from client");

        pair.application.output.write("from app").await.unwrap();
        let received = pair.transport.input.read().await.unwrap();
        assert_eq!(&received.buffer[..], b"from app");
    }

    #[tokio::test]
    async fn completing_one_direction_leaves_the_other_open() {
        let pair = DuplexPipe::create_pair(PipeOptions::default(), PipeOptions::default());
        pair.transport.output.complete(None);

        let result = pair.application.input.read().await.unwrap();
        assert!(result.is_completed);

        pair.application.output.write("still open").await.unwrap();
        let result = pair.transport.input.read().await.unwrap();
        assert_eq!(&result.buffer[..], b"still open");
        assert!(!result.is_completed);
    }

    #[test]
    fn resume_threshold_is_clamped_to_pause() {
        let options = PipeOptions::new(4, 10);
        assert_eq!(options.resume_writer_threshold, 4);
        assert_eq!(PipeOptions::with_max_buffer_size(64).resume_writer_threshold, 32);
    }
}
