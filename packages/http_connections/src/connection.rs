//! Per-connection state shared by the dispatcher, the transports and the application.
//!
//! A connection moves `Inactive → Active → Inactive …` as transports claim and
//! release it, and ends `Disposed`. Only one transport session holds it at a
//! time; every session owns a [`TransportSession`] guard whose drop returns the
//! connection to `Inactive` and wakes whoever waits to supersede it.

use std::borrow::Borrow;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use data_encoding::BASE64URL_NOPAD;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use crate::application::{ApplicationConnection, ConnectionHandler};
use crate::error::{ConnectionError, DispatchError};
use crate::metrics::ConnectionStopStatus;
use crate::options::HttpConnectionOptions;
use crate::pipe::{DuplexPipe, PipeWriter};
use crate::transport::{TransferFormat, TransportType};

/// Shared, run-once outcome of a background task (application or disposal).
pub type TaskOutcome = Shared<BoxFuture<'static, Result<(), ConnectionError>>>;

type ReconnectCallback = Arc<dyn Fn(PipeWriter) + Send + Sync>;

/// Public connection identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

/// Opaque credential a client presents to resume its connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionToken(String);

impl ConnectionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ConnectionToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ConnectionToken {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// 16 random bytes, URL-safe base64.
pub(crate) fn generate_identifier() -> String {
    let bytes: [u8; 16] = rand::random();
    BASE64URL_NOPAD.encode(&bytes)
}

/// Fresh identity. Version 0 clients use the id as their token.
pub(crate) fn new_identity(negotiate_version: u32) -> (ConnectionId, ConnectionToken) {
    let id = generate_identifier();
    let token = if negotiate_version == 0 {
        id.clone()
    } else {
        generate_identifier()
    };
    (ConnectionId(id), ConnectionToken(token))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Inactive,
    Active,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActivationError {
    AlreadyActive,
    Disposed,
}

impl From<ActivationError> for DispatchError {
    fn from(err: ActivationError) -> Self {
        match err {
            ActivationError::AlreadyActive => DispatchError::AlreadyActive,
            ActivationError::Disposed => DispatchError::ConnectionNotFound,
        }
    }
}

pub(crate) enum LongPollActivation {
    /// First poll: the application was started, nothing to wait for.
    Primed,
    Poll(TransportSession),
}

#[derive(Clone)]
struct SessionHandle {
    id: u64,
    superseded: CancellationToken,
    finished: CancellationToken,
}

struct ConnectionState {
    status: ConnectionStatus,
    transport_type: Option<TransportType>,
    last_seen: Instant,
    authentication_expiration: Option<DateTime<Utc>>,
    active_format: TransferFormat,
    has_inherent_keep_alive: bool,
    stateful_reconnect: bool,
    on_reconnected: Option<ReconnectCallback>,
    session: Option<SessionHandle>,
    next_session_id: u64,
    application_task: Option<TaskOutcome>,
    disposal: Option<TaskOutcome>,
    /// First stop reason claimed; later claims observe it.
    stop_status: Option<ConnectionStopStatus>,
    sending_deadline: Option<Instant>,
    send_cancellation: CancellationToken,
}

pub struct ConnectionContext {
    id: ConnectionId,
    token: ConnectionToken,
    created_at: Instant,
    /// Transport-facing ends: reads application output, writes client input.
    transport: DuplexPipe,
    /// Application-facing ends.
    application: DuplexPipe,
    state: Mutex<ConnectionState>,
    closed: CancellationToken,
    close_requested: CancellationToken,
    application_finished: CancellationToken,
    /// Serializes client sends.
    write_lock: tokio::sync::Mutex<()>,
    send_timeout: Duration,
    close_on_authentication_expiration: bool,
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("transport_type", &self.transport_type())
            .finish_non_exhaustive()
    }
}

impl ConnectionContext {
    pub(crate) fn new(
        id: ConnectionId,
        token: ConnectionToken,
        options: &HttpConnectionOptions,
        stateful_reconnect: bool,
    ) -> Arc<Self> {
        let pair = DuplexPipe::create_pair(
            options.transport_pipe_options(),
            options.application_pipe_options(),
        );
        let now = Instant::now();
        Arc::new(Self {
            id,
            token,
            created_at: now,
            transport: pair.transport,
            application: pair.application,
            state: Mutex::new(ConnectionState {
                status: ConnectionStatus::Inactive,
                transport_type: None,
                last_seen: now,
                authentication_expiration: None,
                active_format: TransferFormat::default(),
                has_inherent_keep_alive: false,
                stateful_reconnect,
                on_reconnected: None,
                session: None,
                next_session_id: 0,
                application_task: None,
                disposal: None,
                stop_status: None,
                sending_deadline: None,
                send_cancellation: CancellationToken::new(),
            }),
            closed: CancellationToken::new(),
            close_requested: CancellationToken::new(),
            application_finished: CancellationToken::new(),
            write_lock: tokio::sync::Mutex::new(()),
            send_timeout: options.transport_send_timeout,
            close_on_authentication_expiration: options.close_on_authentication_expiration,
        })
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn token(&self) -> &ConnectionToken {
        &self.token
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state().status
    }

    pub fn transport_type(&self) -> Option<TransportType> {
        self.state().transport_type
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Transport-facing pipe ends.
    pub fn transport(&self) -> &DuplexPipe {
        &self.transport
    }

    /// Application-facing pipe ends.
    pub fn application(&self) -> &DuplexPipe {
        &self.application
    }

    /// Cancelled once disposal begins.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Cancelled when the server asks the application to wind down.
    pub fn close_requested(&self) -> &CancellationToken {
        &self.close_requested
    }

    pub fn request_close(&self) {
        self.close_requested.cancel();
    }

    pub(crate) fn write_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.write_lock
    }

    pub fn active_format(&self) -> TransferFormat {
        self.state().active_format
    }

    pub fn set_active_format(&self, format: TransferFormat) {
        self.state().active_format = format;
    }

    pub fn has_inherent_keep_alive(&self) -> bool {
        self.state().has_inherent_keep_alive
    }

    pub fn is_stateful_reconnect_enabled(&self) -> bool {
        self.state().stateful_reconnect
    }

    /// Permanently refuse further transport takeovers.
    pub fn disable_reconnect(&self) {
        self.state().stateful_reconnect = false;
    }

    pub fn on_reconnected(&self, callback: impl Fn(PipeWriter) + Send + Sync + 'static) {
        self.state().on_reconnected = Some(Arc::new(callback));
    }

    pub fn authentication_expiration(&self) -> Option<DateTime<Utc>> {
        self.state().authentication_expiration
    }

    pub fn set_authentication_expiration(&self, expires_at: Option<DateTime<Utc>>) {
        self.state().authentication_expiration = expires_at;
    }

    /// Configured to close on expiry and the expiration has passed.
    pub fn should_close_for_expiration(&self, now: DateTime<Utc>) -> bool {
        self.close_on_authentication_expiration
            && self
                .authentication_expiration()
                .is_some_and(|expires_at| expires_at <= now)
    }

    /// When the connection went idle, if it is currently `Inactive`.
    pub fn idle_since(&self) -> Option<Instant> {
        let state = self.state();
        (state.status == ConnectionStatus::Inactive).then_some(state.last_seen)
    }

    pub fn is_application_completed(&self) -> bool {
        self.application_finished.is_cancelled()
    }

    /// Bind the connection to `transport` on first use; later requests must match.
    pub(crate) fn claim_transport(&self, transport: TransportType) -> Result<(), DispatchError> {
        let mut state = self.state();
        match state.transport_type {
            None => {
                state.transport_type = Some(transport);
                state.has_inherent_keep_alive = transport == TransportType::LongPolling;
                Ok(())
            }
            Some(current) if current == transport => Ok(()),
            Some(_) => Err(DispatchError::TransportMismatch),
        }
    }

    // ── activation ──────────────────────────────────────────────────────

    /// Claim the connection for one poll, superseding any outstanding poll.
    pub(crate) async fn activate_long_polling(
        self: &Arc<Self>,
        handler: &Arc<dyn ConnectionHandler>,
    ) -> Result<LongPollActivation, ActivationError> {
        let previous = {
            let state = self.state();
            if state.status == ConnectionStatus::Disposed {
                return Err(ActivationError::Disposed);
            }
            state.session.clone()
        };

        if let Some(previous) = previous {
            previous.superseded.cancel();
            previous.finished.cancelled().await;
        }

        let mut state = self.state();
        match state.status {
            ConnectionStatus::Disposed => Err(ActivationError::Disposed),
            ConnectionStatus::Active => Err(ActivationError::AlreadyActive),
            ConnectionStatus::Inactive if state.application_task.is_none() => {
                self.start_application(&mut state, handler);
                state.last_seen = Instant::now();
                info!(connection_id = %self.id, "established long polling connection");
                Ok(LongPollActivation::Primed)
            }
            ConnectionStatus::Inactive => Ok(LongPollActivation::Poll(self.begin_session(&mut state))),
        }
    }

    /// Claim the connection for a streaming transport.
    ///
    /// An `Active` WebSocket connection with stateful reconnect enabled is taken
    /// over: the current session is superseded and awaited first.
    pub(crate) async fn activate_persistent(
        self: &Arc<Self>,
        transport: TransportType,
        handler: &Arc<dyn ConnectionHandler>,
    ) -> Result<TransportSession, ActivationError> {
        let previous = {
            let mut state = self.state();
            match state.status {
                ConnectionStatus::Disposed => return Err(ActivationError::Disposed),
                ConnectionStatus::Inactive => {
                    let activated = self.activate_inactive(&mut state, handler);
                    drop(state);
                    return Ok(self.finish_activation(activated));
                }
                ConnectionStatus::Active => {
                    if transport != TransportType::WebSockets || !state.stateful_reconnect {
                        return Err(ActivationError::AlreadyActive);
                    }
                    state.session.clone()
                }
            }
        };

        if let Some(previous) = previous {
            debug!(connection_id = %self.id, "superseding current websocket for reconnect");
            previous.superseded.cancel();
            previous.finished.cancelled().await;
        }

        let activated = {
            let mut state = self.state();
            match state.status {
                ConnectionStatus::Disposed => return Err(ActivationError::Disposed),
                ConnectionStatus::Active => return Err(ActivationError::AlreadyActive),
                ConnectionStatus::Inactive => self.activate_inactive(&mut state, handler),
            }
        };
        Ok(self.finish_activation(activated))
    }

    fn activate_inactive(
        self: &Arc<Self>,
        state: &mut ConnectionState,
        handler: &Arc<dyn ConnectionHandler>,
    ) -> (TransportSession, Option<ReconnectCallback>) {
        let reconnecting = state.application_task.is_some();
        if !reconnecting {
            self.start_application(state, handler);
        }
        let session = self.begin_session(state);
        let callback = if reconnecting {
            state.on_reconnected.clone()
        } else {
            None
        };
        (session, callback)
    }

    /// Runs outside the state lock so the callback may call back into the connection.
    fn finish_activation(
        &self,
        (session, callback): (TransportSession, Option<ReconnectCallback>),
    ) -> TransportSession {
        if let Some(callback) = callback {
            info!(connection_id = %self.id, "transport reconnected");
            callback(self.application.output.clone());
        }
        session
    }

    fn begin_session(self: &Arc<Self>, state: &mut ConnectionState) -> TransportSession {
        state.status = ConnectionStatus::Active;
        state.last_seen = Instant::now();
        state.next_session_id += 1;

        let handle = SessionHandle {
            id: state.next_session_id,
            superseded: CancellationToken::new(),
            finished: CancellationToken::new(),
        };
        state.session = Some(handle.clone());

        TransportSession {
            context: self.clone(),
            id: handle.id,
            superseded: handle.superseded,
            _finished: handle.finished.drop_guard(),
        }
    }

    fn release_session(&self, id: u64) {
        let mut state = self.state();
        let current = state.session.as_ref().is_some_and(|session| session.id == id);
        if current && state.status == ConnectionStatus::Active {
            state.status = ConnectionStatus::Inactive;
            state.last_seen = Instant::now();
        }
    }

    fn start_application(self: &Arc<Self>, state: &mut ConnectionState, handler: &Arc<dyn ConnectionHandler>) {
        let connection = ApplicationConnection::new(self.clone());
        let handler = handler.clone();
        let pipe = self.application.clone();
        let finished = self.application_finished.clone();
        let id = self.id.clone();

        let task = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(handler.on_connected(connection))
                .catch_unwind()
                .await;
            let result = match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(ConnectionError::Application(format!("{err:#}"))),
                Err(_) => Err(ConnectionError::Application(
                    "application panicked".to_string(),
                )),
            };
            match &result {
                Ok(()) => {
                    debug!(connection_id = %id, "application completed");
                    pipe.output.complete(None);
                }
                Err(err) => {
                    warn!(connection_id = %id, error = %err, "application failed");
                    pipe.output.complete(Some(err.to_string()));
                }
            }
            pipe.input.complete();
            finished.cancel();
            result
        });

        state.application_task = Some(
            task.map(|joined| {
                joined.unwrap_or_else(|err| Err(ConnectionError::Application(err.to_string())))
            })
            .boxed()
            .shared(),
        );
    }

    // ── sends ───────────────────────────────────────────────────────────

    /// Arm the send deadline for one transport send.
    pub(crate) fn start_send(&self) -> SendGuard<'_> {
        let mut state = self.state();
        if state.send_cancellation.is_cancelled() {
            state.send_cancellation = CancellationToken::new();
        }
        state.sending_deadline = Some(Instant::now() + self.send_timeout);
        SendGuard {
            context: self,
            token: state.send_cancellation.clone(),
        }
    }

    /// Cancel the outstanding send if its deadline has passed.
    pub fn try_cancel_send(&self, now: Instant) -> bool {
        let mut state = self.state();
        match state.sending_deadline {
            Some(deadline) if deadline <= now => {
                state.sending_deadline = None;
                state.send_cancellation.cancel();
                warn!(connection_id = %self.id, "send to client timed out");
                true
            }
            _ => false,
        }
    }

    // ── disposal ────────────────────────────────────────────────────────

    /// Tear the connection down. Concurrent and repeated calls share one teardown.
    ///
    /// A graceful close lets an in-flight client send finish; otherwise the send
    /// is released and reported as canceled.
    pub fn dispose(self: &Arc<Self>, close_gracefully: bool) -> TaskOutcome {
        let mut state = self.state();
        if let Some(disposal) = &state.disposal {
            return disposal.clone();
        }

        state.status = ConnectionStatus::Disposed;
        let application = state.application_task.clone();
        let session = state.session.take();

        let this = self.clone();
        let task = tokio::spawn(async move {
            this.dispose_core(close_gracefully, application, session)
                .await
        });
        let disposal = task
            .map(|joined| {
                joined.unwrap_or_else(|err| Err(ConnectionError::Transport(err.to_string())))
            })
            .boxed()
            .shared();
        state.disposal = Some(disposal.clone());
        disposal
    }

    async fn dispose_core(
        &self,
        close_gracefully: bool,
        application: Option<TaskOutcome>,
        session: Option<SessionHandle>,
    ) -> Result<(), ConnectionError> {
        debug!(connection_id = %self.id, close_gracefully, "disposing connection");
        self.closed.cancel();

        if !close_gracefully {
            self.transport.output.cancel_pending_flush();
        }
        {
            let _write = self.write_lock.lock().await;
            self.transport.output.complete(None);
        }

        if let Some(session) = session {
            session.finished.cancelled().await;
        }
        // No transport reads application output past this point
        self.transport.input.complete();

        let result = match application {
            Some(task) => task.await,
            None => Ok(()),
        };
        debug!(connection_id = %self.id, "connection disposed");
        result
    }

    /// Record why the connection is stopping. The first claim wins and is returned to every caller.
    pub fn claim_stop_status(&self, status: ConnectionStopStatus) -> ConnectionStopStatus {
        *self.state().stop_status.get_or_insert(status)
    }

    /// Disposal outcome, if disposal has started.
    pub fn disposal(&self) -> Option<TaskOutcome> {
        self.state().disposal.clone()
    }
}

/// Exclusive hold of a connection by one transport request.
///
/// Dropping it (including when the request future is dropped) returns the
/// connection to `Inactive` and unblocks a superseding request.
#[cfg_attr(test, derive(Debug))]
pub(crate) struct TransportSession {
    context: Arc<ConnectionContext>,
    id: u64,
    superseded: CancellationToken,
    _finished: DropGuard,
}

impl TransportSession {
    pub(crate) fn context(&self) -> &Arc<ConnectionContext> {
        &self.context
    }

    /// Resolves when a newer request takes the connection over.
    pub(crate) fn superseded(&self) -> WaitForCancellationFuture<'_> {
        self.superseded.cancelled()
    }

    #[cfg(test)]
    pub(crate) fn is_superseded(&self) -> bool {
        self.superseded.is_cancelled()
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.context.release_session(self.id);
    }
}

/// Armed send deadline; disarmed on drop.
pub(crate) struct SendGuard<'a> {
    context: &'a ConnectionContext,
    token: CancellationToken,
}

impl SendGuard<'_> {
    /// Resolves when the sweep finds the deadline passed.
    pub(crate) fn timed_out(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        self.context.state().sending_deadline = None;
    }
}
