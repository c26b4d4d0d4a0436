//! Request dispatch for the connection endpoint.
//!
//! Mounted under some root, the router serves:
//! - `POST {root}/negotiate`: allocate a connection and offer transports
//! - `GET {root}?id=`: run a transport (WebSockets, SSE or a long poll)
//! - `POST {root}?id=`: send bytes to the application
//! - `DELETE {root}?id=`: terminate a Long Polling connection

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequestParts, Query, Request, State, WebSocketUpgrade};
use axum::http::request::Parts;
use axum::http::{Method, StatusCode, Uri, Version, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, info};

use crate::application::ConnectionHandler;
use crate::connection::{ConnectionContext, ConnectionStatus};
use crate::error::DispatchError;
use crate::metrics::ConnectionStopStatus;
use crate::negotiate::{self, NegotiateErrorResponse, NegotiateRequest};
use crate::options::HttpConnectionOptions;
use crate::registry::ConnectionRegistry;
use crate::transport::{
    TransportType, apply_no_cache_headers, is_event_stream_request, is_websocket_request,
    long_polling, sse, websockets,
};

/// Outcome of authenticating the request, decided upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthorizationDecision {
    #[default]
    Allowed,
    Unauthenticated,
    Forbidden,
}

/// Request extension carrying the caller's authorization.
///
/// Requests without it are treated as allowed with no expiration.
#[derive(Debug, Clone, Default)]
pub struct ConnectionAuthorization {
    pub decision: AuthorizationDecision,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ConnectionAuthorization {
    pub fn allowed_until(expires_at: DateTime<Utc>) -> Self {
        Self {
            decision: AuthorizationDecision::Allowed,
            expires_at: Some(expires_at),
        }
    }

    fn check(&self) -> Result<(), DispatchError> {
        match self.decision {
            AuthorizationDecision::Allowed => Ok(()),
            AuthorizationDecision::Unauthenticated => Err(DispatchError::Unauthenticated),
            AuthorizationDecision::Forbidden => Err(DispatchError::Forbidden),
        }
    }
}

#[derive(Clone)]
pub struct HttpConnectionDispatcher {
    registry: Arc<ConnectionRegistry>,
    options: Arc<HttpConnectionOptions>,
    handler: Arc<dyn ConnectionHandler>,
}

impl HttpConnectionDispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        options: HttpConnectionOptions,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        Self {
            registry,
            options: Arc::new(options),
            handler,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &HttpConnectionOptions {
        &self.options
    }

    /// Routes relative to the mount point; nest the result under the endpoint path.
    pub fn router<S>(self) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        Router::new()
            .route("/negotiate", post(negotiate_handler))
            .route(
                "/",
                get(connection_handler)
                    .post(connection_handler)
                    .delete(connection_handler),
            )
            .with_state(self)
    }

    async fn negotiate(&self, parts: &Parts) -> Response {
        let query = query_params(&parts.uri);
        let request = NegotiateRequest::from_query(&query, parts.version == Version::HTTP_11);

        let mut response = match negotiate::negotiate(&self.registry, &self.options, &request).await {
            Ok(body) => Json(body).into_response(),
            Err(err) => {
                debug!(error = %err, "negotiation rejected");
                Json(NegotiateErrorResponse {
                    error: err.to_string(),
                })
                .into_response()
            }
        };
        apply_no_cache_headers(response.headers_mut());
        response
    }

    async fn lookup(&self, id: Option<&str>) -> Result<Arc<ConnectionContext>, DispatchError> {
        let id = id.ok_or(DispatchError::ConnectionIdRequired)?;
        self.registry
            .lookup(id)
            .await
            .filter(|connection| connection.status() != ConnectionStatus::Disposed)
            .ok_or(DispatchError::ConnectionNotFound)
    }

    async fn connect(
        &self,
        parts: &mut Parts,
        id: Option<&str>,
        authorization: &ConnectionAuthorization,
    ) -> Result<Response, DispatchError> {
        let transport = if is_websocket_request(&parts.method, &parts.headers) {
            TransportType::WebSockets
        } else if is_event_stream_request(&parts.headers) {
            TransportType::ServerSentEvents
        } else {
            TransportType::LongPolling
        };
        if !self.options.transports.contains(transport) {
            return Err(DispatchError::TransportNotSupported(transport));
        }

        let upgrade = if transport == TransportType::WebSockets {
            match WebSocketUpgrade::from_request_parts(parts, &()).await {
                Ok(upgrade) => Some(upgrade),
                Err(rejection) => return Ok(rejection.into_response()),
            }
        } else {
            None
        };

        let connection = match id {
            None if transport == TransportType::WebSockets => {
                debug!("creating connection for websocket request without an id");
                self.registry.create(&self.options, 0, false).await
            }
            id => self.lookup(id).await?,
        };
        connection.claim_transport(transport)?;

        if let Some(expires_at) = authorization.expires_at {
            connection.set_authentication_expiration(Some(expires_at));
        }
        if connection.should_close_for_expiration(Utc::now()) {
            info!(connection_id = %connection.id(), %transport, "refusing request, authentication expired");
            connection.request_close();
            let registry = self.registry.clone();
            let expired = connection.clone();
            tokio::spawn(async move {
                registry
                    .dispose_and_remove(&expired, false, ConnectionStopStatus::AuthenticationExpired)
                    .await;
            });
            return match transport {
                TransportType::LongPolling => {
                    let mut response =
                        (StatusCode::NO_CONTENT, [(header::CONTENT_TYPE, "text/plain")]).into_response();
                    apply_no_cache_headers(response.headers_mut());
                    Ok(response)
                }
                _ => Err(DispatchError::ConnectionNotFound),
            };
        }

        match (transport, upgrade) {
            (TransportType::WebSockets, Some(upgrade)) => {
                websockets::handle_websocket(
                    self.registry.clone(),
                    &connection,
                    &self.handler,
                    upgrade,
                    self.options.websockets.close_timeout,
                )
                .await
            }
            (TransportType::ServerSentEvents, _) => {
                sse::handle_event_stream(self.registry.clone(), &connection, &self.handler).await
            }
            _ => {
                long_polling::handle_poll(
                    &self.registry,
                    &connection,
                    &self.handler,
                    self.options.long_polling.poll_timeout,
                )
                .await
            }
        }
    }

    /// Stream a POST body into the application's input.
    async fn send(&self, id: Option<&str>, body: Body) -> Result<Response, DispatchError> {
        let connection = self.lookup(id).await?;
        if connection.transport_type() == Some(TransportType::WebSockets) {
            return Err(DispatchError::PostNotAllowed);
        }

        let _write = connection.write_lock().lock().await;
        if connection.status() == ConnectionStatus::Disposed {
            return Err(DispatchError::ConnectionNotFound);
        }

        let output = &connection.transport().output;
        let mut chunks = body.into_data_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|err| {
                debug!(connection_id = %connection.id(), error = %err, "failed to read request body");
                DispatchError::RequestBody
            })?;
            match output.write(chunk).await {
                Ok(flush) if flush.is_canceled => return Err(DispatchError::ConnectionNotFound),
                Ok(flush) if flush.is_completed => break,
                Ok(_) => {}
                Err(_) => return Err(DispatchError::ConnectionNotFound),
            }
        }

        Ok(StatusCode::OK.into_response())
    }

    async fn terminate(&self, id: Option<&str>) -> Result<Response, DispatchError> {
        let connection = self.lookup(id).await?;
        if connection.transport_type() != Some(TransportType::LongPolling) {
            return Err(DispatchError::TerminateNotSupported);
        }

        info!(connection_id = %connection.id(), "terminating long polling connection by DELETE request");
        connection.transport().output.complete(None);

        let registry = self.registry.clone();
        tokio::spawn(async move {
            registry
                .dispose_and_remove(&connection, false, ConnectionStopStatus::NormalClosure)
                .await;
        });

        Ok((StatusCode::ACCEPTED, [(header::CONTENT_TYPE, "text/plain")]).into_response())
    }
}

async fn negotiate_handler(State(dispatcher): State<HttpConnectionDispatcher>, request: Request) -> Response {
    let (parts, _body) = request.into_parts();
    let authorization = authorization(&parts);
    if let Err(err) = authorization.check() {
        return err.into_response();
    }
    dispatcher.negotiate(&parts).await
}

async fn connection_handler(State(dispatcher): State<HttpConnectionDispatcher>, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();
    let authorization = authorization(&parts);
    let query = query_params(&parts.uri);
    let id = query_value(&query, "id");

    let result = match authorization.check() {
        Err(err) => Err(err),
        Ok(()) => match parts.method.clone() {
            Method::GET => dispatcher.connect(&mut parts, id, &authorization).await,
            Method::POST => dispatcher.send(id, body).await,
            Method::DELETE => dispatcher.terminate(id).await,
            _ => Ok(StatusCode::METHOD_NOT_ALLOWED.into_response()),
        },
    };

    result.unwrap_or_else(|err| {
        debug!(method = %parts.method, error_code = err.error_code(), error = %err, "connection request rejected");
        let mut response = err.into_response();
        apply_no_cache_headers(response.headers_mut());
        response
    })
}

fn authorization(parts: &Parts) -> ConnectionAuthorization {
    parts
        .extensions
        .get::<ConnectionAuthorization>()
        .cloned()
        .unwrap_or_default()
}

fn query_params(uri: &Uri) -> HashMap<String, String> {
    Query::<HashMap<String, String>>::try_from_uri(uri)
        .map(|Query(query)| query)
        .unwrap_or_default()
}

fn query_value<'a>(query: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, value)| value.as_str())
}
