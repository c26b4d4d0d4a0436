//! Connection negotiation: version agreement, identity allocation and the
//! transport offer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::options::HttpConnectionOptions;
use crate::registry::ConnectionRegistry;
use crate::transport::{HttpTransports, TransferFormat, TransportType};

/// Highest negotiate version this server speaks.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    pub negotiate_version: u32,
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_token: Option<String>,
    pub available_transports: Vec<AvailableTransport>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub use_stateful_reconnect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableTransport {
    pub transport: TransportType,
    pub transfer_formats: Vec<TransferFormat>,
}

/// Body returned instead of a [`NegotiateResponse`] when negotiation fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiateErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiateVersionError {
    #[error(
        "The client requested version '{requested}', but the server does not support this version. The minimum supported version is '{minimum}'."
    )]
    Unsupported { requested: i64, minimum: u32 },

    #[error("The client requested a non-integer protocol version.")]
    NonInteger,
}

/// What the client asked for, extracted from the negotiate request.
#[derive(Debug, Clone, Default)]
pub struct NegotiateRequest {
    /// Raw `negotiateVersion` query value, if present.
    pub negotiate_version: Option<String>,
    pub use_stateful_reconnect: bool,
    /// Whether this request could be upgraded to a WebSocket.
    pub websockets_available: bool,
}

impl NegotiateRequest {
    /// Build from query parameters; keys match case-insensitively.
    pub fn from_query(query: &HashMap<String, String>, websockets_available: bool) -> Self {
        let value = |key: &str| {
            query
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(key))
                .map(|(_, value)| value.clone())
        };
        Self {
            negotiate_version: value("negotiateVersion"),
            use_stateful_reconnect: value("useStatefulReconnect")
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
            websockets_available,
        }
    }
}

/// Agree on a negotiate version. A missing version means 0; versions newer
/// than the server's are clamped.
pub fn resolve_version(requested: Option<&str>, minimum: u32) -> Result<u32, NegotiateVersionError> {
    let requested = match requested {
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|_| NegotiateVersionError::NonInteger)?,
        None => 0,
    };
    if requested < i64::from(minimum) {
        return Err(NegotiateVersionError::Unsupported { requested, minimum });
    }
    Ok(requested.min(i64::from(PROTOCOL_VERSION)) as u32)
}

/// Configured transports the request can actually use, in preference order.
pub fn available_transports(transports: HttpTransports, websockets_available: bool) -> Vec<AvailableTransport> {
    transports
        .iter()
        .filter(|transport| *transport != TransportType::WebSockets || websockets_available)
        .map(|transport| AvailableTransport {
            transport,
            transfer_formats: transport.transfer_formats().to_vec(),
        })
        .collect()
}

/// Allocate a connection for a negotiate request.
pub async fn negotiate(
    registry: &ConnectionRegistry,
    options: &HttpConnectionOptions,
    request: &NegotiateRequest,
) -> Result<NegotiateResponse, NegotiateVersionError> {
    let version = resolve_version(
        request.negotiate_version.as_deref(),
        options.minimum_protocol_version,
    )?;
    let use_stateful_reconnect = options.allow_stateful_reconnects && request.use_stateful_reconnect;

    let connection = registry
        .create(options, version, use_stateful_reconnect)
        .await;
    debug!(connection_id = %connection.id(), version, "negotiated connection");

    Ok(NegotiateResponse {
        negotiate_version: version,
        connection_id: connection.id().to_string(),
        connection_token: (version > 0).then(|| connection.token().to_string()),
        available_transports: available_transports(options.transports, request.websockets_available),
        use_stateful_reconnect,
    })
}
