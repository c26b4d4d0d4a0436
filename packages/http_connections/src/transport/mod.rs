//! Transport identities and the three transport processors.

pub mod long_polling;
pub mod sse;
pub mod websockets;

use std::fmt;

use axum::http::{HeaderMap, HeaderValue, Method, header};
use serde::{Deserialize, Serialize};

/// One of the wire transports a connection can run over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    WebSockets,
    ServerSentEvents,
    LongPolling,
}

impl TransportType {
    pub const ALL: [TransportType; 3] = [
        TransportType::WebSockets,
        TransportType::ServerSentEvents,
        TransportType::LongPolling,
    ];

    fn bit(self) -> u8 {
        match self {
            TransportType::WebSockets => 1,
            TransportType::ServerSentEvents => 2,
            TransportType::LongPolling => 4,
        }
    }

    /// Payload formats the transport can carry.
    pub fn transfer_formats(self) -> &'static [TransferFormat] {
        match self {
            TransportType::WebSockets | TransportType::LongPolling => {
                &[TransferFormat::Text, TransferFormat::Binary]
            }
            TransportType::ServerSentEvents => &[TransferFormat::Text],
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportType::WebSockets => "WebSockets",
            TransportType::ServerSentEvents => "ServerSentEvents",
            TransportType::LongPolling => "LongPolling",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransferFormat {
    #[default]
    Text,
    Binary,
}

/// Set of enabled transports.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct HttpTransports(u8);

impl HttpTransports {
    pub const NONE: HttpTransports = HttpTransports(0);
    pub const ALL: HttpTransports = HttpTransports(7);

    pub fn contains(self, transport: TransportType) -> bool {
        self.0 & transport.bit() != 0
    }

    pub fn with(self, transport: TransportType) -> Self {
        HttpTransports(self.0 | transport.bit())
    }

    pub fn without(self, transport: TransportType) -> Self {
        HttpTransports(self.0 & !transport.bit())
    }

    /// Enabled transports in preference order.
    pub fn iter(self) -> impl Iterator<Item = TransportType> {
        TransportType::ALL
            .into_iter()
            .filter(move |transport| self.contains(*transport))
    }
}

impl FromIterator<TransportType> for HttpTransports {
    fn from_iter<I: IntoIterator<Item = TransportType>>(iter: I) -> Self {
        iter.into_iter()
            .fold(HttpTransports::NONE, HttpTransports::with)
    }
}

impl fmt::Debug for HttpTransports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Headers that keep intermediaries from caching poll and event-stream responses.
pub fn apply_no_cache_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::EXPIRES,
        HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"),
    );
}

/// `Accept` lists `text/event-stream`.
pub fn is_event_stream_request(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|media| media.split(';').next())
        .any(|media| media.trim().eq_ignore_ascii_case("text/event-stream"))
}

/// A GET asking to upgrade to the WebSocket protocol.
pub fn is_websocket_request(method: &Method, headers: &HeaderMap) -> bool {
    *method == Method::GET
        && headers
            .get(header::UPGRADE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transports_set_membership() {
        let set = HttpTransports::ALL.without(TransportType::WebSockets);
        assert!(!set.contains(TransportType::WebSockets));
        assert!(set.contains(TransportType::LongPolling));
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![TransportType::ServerSentEvents, TransportType::LongPolling]
        );

        let collected: HttpTransports = [TransportType::LongPolling].into_iter().collect();
        assert_eq!(collected, HttpTransports::NONE.with(TransportType::LongPolling));
    }

    #[test]
    fn event_stream_detection_ignores_parameters_and_order() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json, Text/Event-Stream;q=0.9"),
        );
        assert!(is_event_stream_request(&headers));

        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        assert!(!is_event_stream_request(&headers));
    }

    #[test]
    fn websocket_detection_requires_get_and_upgrade() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_request(&Method::GET, &headers));
        assert!(!is_websocket_request(&Method::POST, &headers));
        assert!(!is_websocket_request(&Method::GET, &HeaderMap::new()));
    }

    #[test]
    fn transport_names_match_wire_format() {
        assert_eq!(TransportType::ServerSentEvents.to_string(), "ServerSentEvents");
        assert_eq!(
            serde_json::to_string(&TransportType::LongPolling).unwrap(),
            "\"LongPolling\""
        );
        assert_eq!(
            TransportType::ServerSentEvents.transfer_formats(),
            &[TransferFormat::Text]
        );
    }
}
