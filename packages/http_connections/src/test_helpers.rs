use std::sync::Arc;
use std::time::Duration;

use crate::application::{ApplicationConnection, ConnectionHandler};
use crate::connection::{ConnectionContext, new_identity};
use crate::metrics::ConnectionMetrics;
use crate::options::{ConnectionOptions, HttpConnectionOptions};
use crate::registry::ConnectionRegistry;

/// A standalone connection with a version 1 identity, not registered anywhere.
pub fn test_connection(options: HttpConnectionOptions) -> Arc<ConnectionContext> {
    let (id, token) = new_identity(1);
    ConnectionContext::new(id, token, &options, false)
}

pub fn test_registry(options: ConnectionOptions) -> Arc<ConnectionRegistry> {
    Arc::new(ConnectionRegistry::new(options, Arc::new(ConnectionMetrics::new())))
}

/// Writes every received chunk straight back until the client stops sending.
pub fn echo_handler() -> Arc<dyn ConnectionHandler> {
    Arc::new(|connection: ApplicationConnection| async move {
        loop {
            let read = connection.input().read().await?;
            if !read.buffer.is_empty() {
                let flush = connection.output().write(read.buffer).await?;
                if flush.is_completed {
                    break;
                }
            }
            if read.is_completed {
                break;
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}

/// Runs until the connection is disposed.
pub fn never_ending_handler() -> Arc<dyn ConnectionHandler> {
    Arc::new(|connection: ApplicationConnection| async move {
        connection.closed().cancelled().await;
        Ok::<(), anyhow::Error>(())
    })
}

/// Poll until the registry no longer knows `token`.
pub async fn wait_until_removed(registry: &Arc<ConnectionRegistry>, token: &str) {
    for _ in 0..500 {
        if registry.lookup(token).await.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("connection {token} was never removed");
}
