//! Error types for connection handling and request dispatch.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::pipe::PipeError;
use crate::transport::TransportType;

/// Terminal outcome of an application or transport task.
///
/// `Clone` so that every caller of a shared disposal observes the same result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("application failed: {0}")]
    Application(String),

    #[error("transport failed: {0}")]
    Transport(String),

    #[error(transparent)]
    Pipe(#[from] PipeError),
}

/// Request-level failures the dispatcher reports to the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Connection ID required")]
    ConnectionIdRequired,

    #[error("No Connection with that ID")]
    ConnectionNotFound,

    #[error("{0} transport not supported by this end point type")]
    TransportNotSupported(TransportType),

    #[error("Cannot change transports mid-connection")]
    TransportMismatch,

    #[error("POST requests are not allowed for WebSocket connections.")]
    PostNotAllowed,

    #[error("Cannot terminate this connection using the DELETE endpoint.")]
    TerminateNotSupported,

    #[error("Connection is already active")]
    AlreadyActive,

    #[error("Failed to read the request body")]
    RequestBody,

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Access denied")]
    Forbidden,
}

impl DispatchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ConnectionIdRequired
            | Self::TransportMismatch
            | Self::TerminateNotSupported
            | Self::RequestBody => StatusCode::BAD_REQUEST,
            Self::ConnectionNotFound | Self::TransportNotSupported(_) => StatusCode::NOT_FOUND,
            Self::PostNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::AlreadyActive => StatusCode::CONFLICT,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
        }
    }

    /// Stable machine-readable code for logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionIdRequired => "connection_id_required",
            Self::ConnectionNotFound => "connection_not_found",
            Self::TransportNotSupported(_) => "transport_not_supported",
            Self::TransportMismatch => "transport_mismatch",
            Self::PostNotAllowed => "post_not_allowed",
            Self::TerminateNotSupported => "terminate_not_supported",
            Self::AlreadyActive => "already_active",
            Self::RequestBody => "request_body",
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        // Conflicts carry no body
        let body = match self {
            Self::AlreadyActive => String::new(),
            ref other => other.to_string(),
        };
        let mut response = (self.status_code(), body).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain"),
        );
        response
    }
}
