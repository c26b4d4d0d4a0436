use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use http_connections::{
    ConnectionOptions, HttpConnectionOptions, HttpTransports, LongPollingOptions, TransportType,
    WebSocketOptions,
};
use serde::{Deserialize, Serialize};

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [connections]
//                    poll_timeout_secs = 30
//
//   env var:         CONNECTIONS_CONNECTIONS__POLL_TIMEOUT_SECS=30
//
// Double underscore nests into a section; single underscores stay in field names.

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub connections: ConnectionsFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Mount point of the connection endpoint.
    #[serde(default = "default_path")]
    pub path: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
        }
    }
}

/// Endpoint tunables (lives under `[connections]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionsFileConfig {
    #[serde(default = "default_transports")]
    pub transports: Vec<TransportType>,
    /// 0 disables backpressure on client sends.
    #[serde(default = "default_buffer_kb")]
    pub transport_max_buffer_kb: usize,
    /// 0 disables backpressure on application writes.
    #[serde(default = "default_buffer_kb")]
    pub application_max_buffer_kb: usize,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_disconnect_timeout_secs")]
    pub disconnect_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default)]
    pub minimum_protocol_version: u32,
    #[serde(default)]
    pub close_on_authentication_expiration: bool,
    #[serde(default)]
    pub allow_stateful_reconnects: bool,
}

impl Default for ConnectionsFileConfig {
    fn default() -> Self {
        Self {
            transports: default_transports(),
            transport_max_buffer_kb: default_buffer_kb(),
            application_max_buffer_kb: default_buffer_kb(),
            poll_timeout_secs: default_poll_timeout_secs(),
            close_timeout_secs: default_close_timeout_secs(),
            send_timeout_secs: default_send_timeout_secs(),
            disconnect_timeout_secs: default_disconnect_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            minimum_protocol_version: 0,
            close_on_authentication_expiration: false,
            allow_stateful_reconnects: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    5000
}
fn default_path() -> String {
    "/connections".to_string()
}
fn default_transports() -> Vec<TransportType> {
    TransportType::ALL.to_vec()
}
fn default_buffer_kb() -> usize {
    64
}
fn default_poll_timeout_secs() -> u64 {
    90
}
fn default_close_timeout_secs() -> u64 {
    5
}
fn default_send_timeout_secs() -> u64 {
    10
}
fn default_disconnect_timeout_secs() -> u64 {
    15
}
fn default_sweep_interval_ms() -> u64 {
    1000
}

/// Build a figment that layers: defaults → config file → CONNECTIONS_* env vars.
///
/// A missing config file is not an error; the defaults and env vars still apply.
pub fn load_config(config_file: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("CONNECTIONS_").split("__"))
}

// =============================================================================
// Runtime config
// =============================================================================

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub path: String,
    pub endpoint: HttpConnectionOptions,
    pub registry: ConnectionOptions,
    pub sweep_interval: Duration,
}

impl ServerConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        let addr = format!("{}:{}", fc.server.host, fc.server.port)
            .parse::<SocketAddr>()
            .with_context(|| {
                format!(
                    "invalid listen address {}:{}",
                    fc.server.host, fc.server.port
                )
            })?;
        let path = normalize_path(&fc.server.path)?;
        let c = &fc.connections;

        Ok(Self {
            addr,
            path,
            endpoint: HttpConnectionOptions {
                transports: c.transports.iter().copied().collect::<HttpTransports>(),
                transport_max_buffer_size: c.transport_max_buffer_kb * 1024,
                application_max_buffer_size: c.application_max_buffer_kb * 1024,
                long_polling: LongPollingOptions {
                    poll_timeout: Duration::from_secs(c.poll_timeout_secs),
                },
                websockets: WebSocketOptions {
                    close_timeout: Duration::from_secs(c.close_timeout_secs),
                },
                transport_send_timeout: Duration::from_secs(c.send_timeout_secs),
                minimum_protocol_version: c.minimum_protocol_version,
                close_on_authentication_expiration: c.close_on_authentication_expiration,
                allow_stateful_reconnects: c.allow_stateful_reconnects,
            },
            registry: ConnectionOptions {
                disconnect_timeout: Duration::from_secs(c.disconnect_timeout_secs),
            },
            sweep_interval: Duration::from_millis(c.sweep_interval_ms.max(1)),
        })
    }
}

/// `connections/` → `/connections`. The root itself cannot host the endpoint.
fn normalize_path(path: &str) -> Result<String> {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        anyhow::bail!("endpoint path must not be the root");
    }
    Ok(format!("/{trimmed}"))
}
