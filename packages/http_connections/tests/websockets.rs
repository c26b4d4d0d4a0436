use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use http_connections::{
    ApplicationConnection, ConnectionHandler, ConnectionMetrics, ConnectionOptions,
    ConnectionRegistry, ConnectionStatus, HttpConnectionDispatcher, HttpConnectionOptions,
    PipeWriter, TransferFormat, WebSocketOptions,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    options: HttpConnectionOptions,
}

impl TestServer {
    async fn start(options: HttpConnectionOptions, handler: Arc<dyn ConnectionHandler>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(
            ConnectionOptions::default(),
            Arc::new(ConnectionMetrics::new()),
        ));
        let dispatcher = HttpConnectionDispatcher::new(registry.clone(), options.clone(), handler);
        let app = Router::new().nest("/connections", dispatcher.router());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            registry,
            options,
        }
    }

    async fn negotiate(&self, stateful_reconnect: bool) -> String {
        let connection = self
            .registry
            .create(&self.options, 1, stateful_reconnect)
            .await;
        connection.token().to_string()
    }

    fn url(&self, token: Option<&str>) -> String {
        match token {
            Some(token) => format!("ws://{}/connections?id={token}", self.addr),
            None => format!("ws://{}/connections", self.addr),
        }
    }

    async fn connect(&self, token: &str) -> Client {
        let (client, _) = connect_async(self.url(Some(token))).await.unwrap();
        client
    }

    /// Removal can trail the socket by up to the close timeout.
    async fn wait_until_removed(&self, token: &str) {
        for _ in 0..1000 {
            if self.registry.lookup(token).await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connection {token} was never removed");
    }
}

async fn next_frame(client: &mut Client) -> Option<Message> {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), client.next()).await {
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(Some(Ok(message))) => return Some(message),
            Ok(Some(Err(_))) | Ok(None) => return None,
            Err(_) => panic!("timed out waiting for a frame"),
        }
    }
}

fn close_code(message: Option<Message>) -> Option<CloseCode> {
    match message {
        Some(Message::Close(Some(frame))) => Some(frame.code),
        _ => None,
    }
}

fn echo() -> Arc<dyn ConnectionHandler> {
    Arc::new(|connection: ApplicationConnection| async move {
        loop {
            let read = connection.input().read().await?;
            if !read.buffer.is_empty() {
                connection.output().write(read.buffer).await?;
            }
            if read.is_completed {
                return Ok::<(), anyhow::Error>(());
            }
        }
    })
}

/// Registers a reconnect hook, announces itself, then echoes.
fn reconnecting_echo(disable_reconnect: bool) -> Arc<dyn ConnectionHandler> {
    Arc::new(move |connection: ApplicationConnection| async move {
        if disable_reconnect {
            connection.disable_reconnect();
        }
        connection.on_reconnected(|writer: PipeWriter| {
            let _ = writer.push(Bytes::from_static(b"reconnected"));
        });
        connection.output().write("ready").await?;
        loop {
            let read = connection.input().read().await?;
            if !read.buffer.is_empty() {
                connection.output().write(read.buffer).await?;
            }
            if read.is_completed {
                return Ok::<(), anyhow::Error>(());
            }
        }
    })
}

fn stateful_options() -> HttpConnectionOptions {
    HttpConnectionOptions {
        allow_stateful_reconnects: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn text_frames_echo_and_close_cleanly() {
    let server = TestServer::start(HttpConnectionOptions::default(), echo()).await;
    let token = server.negotiate(false).await;
    let mut client = server.connect(&token).await;

    client.send(Message::text("Hello World")).await.unwrap();
    let reply = next_frame(&mut client).await.unwrap();
    assert_eq!(reply.to_text().unwrap(), "Hello World");

    client.send(Message::Close(None)).await.unwrap();
    server.wait_until_removed(&token).await;
}

#[tokio::test]
async fn binary_format_sends_binary_frames() {
    let handler: Arc<dyn ConnectionHandler> = Arc::new(|connection: ApplicationConnection| async move {
        connection.set_active_format(TransferFormat::Binary);
        connection.output().write(vec![0u8, 159, 146, 150]).await?;
        connection.closed().cancelled().await;
        Ok::<(), anyhow::Error>(())
    });
    let server = TestServer::start(HttpConnectionOptions::default(), handler).await;
    let token = server.negotiate(false).await;
    let mut client = server.connect(&token).await;

    let frame = next_frame(&mut client).await.unwrap();
    assert_eq!(frame, Message::binary(vec![0u8, 159, 146, 150]));
}

#[tokio::test]
async fn text_split_inside_a_character_is_delivered_whole() {
    let handler: Arc<dyn ConnectionHandler> = Arc::new(|connection: ApplicationConnection| async move {
        // "aéb" with the two-byte é split across writes
        connection.output().write(vec![b'a', 0xC3]).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        connection.output().write(vec![0xA9, b'b']).await?;
        connection.closed().cancelled().await;
        Ok::<(), anyhow::Error>(())
    });
    let server = TestServer::start(HttpConnectionOptions::default(), handler).await;
    let token = server.negotiate(false).await;
    let mut client = server.connect(&token).await;

    let mut received = String::new();
    while received.len() < "aéb".len() {
        match next_frame(&mut client).await {
            Some(Message::Text(text)) => received.push_str(text.as_str()),
            other => panic!("expected a text frame, got close code {:?}", close_code(other)),
        }
    }
    assert_eq!(received, "aéb");
    assert_eq!(
        server.registry.lookup(&token).await.unwrap().status(),
        ConnectionStatus::Active
    );
}

#[tokio::test]
async fn application_completion_sends_normal_close() {
    let handler: Arc<dyn ConnectionHandler> = Arc::new(|connection: ApplicationConnection| async move {
        connection.output().write("bye").await?;
        Ok::<(), anyhow::Error>(())
    });
    let server = TestServer::start(HttpConnectionOptions::default(), handler).await;
    let token = server.negotiate(false).await;
    let mut client = server.connect(&token).await;

    assert_eq!(next_frame(&mut client).await.unwrap().to_text().unwrap(), "bye");
    assert_eq!(close_code(next_frame(&mut client).await), Some(CloseCode::Normal));
    // Reading on flushes our half of the close handshake
    assert!(next_frame(&mut client).await.is_none());
    server.wait_until_removed(&token).await;
}

#[tokio::test]
async fn application_failure_sends_error_close() {
    let handler: Arc<dyn ConnectionHandler> = Arc::new(|_connection: ApplicationConnection| async {
        Err::<(), _>(anyhow::anyhow!("application failed"))
    });
    let server = TestServer::start(HttpConnectionOptions::default(), handler).await;
    let token = server.negotiate(false).await;
    let mut client = server.connect(&token).await;

    assert_eq!(close_code(next_frame(&mut client).await), Some(CloseCode::Error));
    assert!(next_frame(&mut client).await.is_none());
    server.wait_until_removed(&token).await;
}

#[tokio::test]
async fn second_socket_for_an_active_connection_conflicts() {
    let server = TestServer::start(HttpConnectionOptions::default(), echo()).await;
    let token = server.negotiate(false).await;
    let _first = server.connect(&token).await;

    match connect_async(server.url(Some(&token))).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 409),
        Err(err) => panic!("unexpected error: {err}"),
        Ok(_) => panic!("expected a conflict"),
    }
}

#[tokio::test]
async fn socket_without_id_gets_a_connection() {
    let server = TestServer::start(HttpConnectionOptions::default(), echo()).await;
    let (mut client, _) = connect_async(server.url(None)).await.unwrap();

    client.send(Message::text("anonymous")).await.unwrap();
    assert_eq!(next_frame(&mut client).await.unwrap().to_text().unwrap(), "anonymous");
    assert_eq!(server.registry.len().await, 1);
}

#[tokio::test]
async fn close_timeout_bounds_a_stuck_application() {
    let handler: Arc<dyn ConnectionHandler> = Arc::new(|connection: ApplicationConnection| async move {
        // Ignores the end of input; only disposal stops it
        connection.closed().cancelled().await;
        Ok::<(), anyhow::Error>(())
    });
    let options = HttpConnectionOptions {
        websockets: WebSocketOptions {
            close_timeout: Duration::from_millis(100),
        },
        ..Default::default()
    };
    let server = TestServer::start(options, handler).await;
    let token = server.negotiate(false).await;
    let mut client = server.connect(&token).await;

    client.send(Message::Close(None)).await.unwrap();
    server.wait_until_removed(&token).await;
}

// --- Stateful reconnect ---

#[tokio::test]
async fn reconnect_takes_over_the_active_socket() {
    let server = TestServer::start(stateful_options(), reconnecting_echo(false)).await;
    let token = server.negotiate(true).await;

    let mut first = server.connect(&token).await;
    assert_eq!(next_frame(&mut first).await.unwrap().to_text().unwrap(), "ready");

    let mut second = server.connect(&token).await;
    assert_eq!(
        next_frame(&mut second).await.unwrap().to_text().unwrap(),
        "reconnected"
    );

    second.send(Message::text("still here")).await.unwrap();
    assert_eq!(
        next_frame(&mut second).await.unwrap().to_text().unwrap(),
        "still here"
    );

    let connection = server.registry.lookup(&token).await.unwrap();
    assert_eq!(connection.status(), ConnectionStatus::Active);
}

#[tokio::test]
async fn dropped_socket_waits_for_reconnect() {
    let server = TestServer::start(stateful_options(), reconnecting_echo(false)).await;
    let token = server.negotiate(true).await;

    let mut first = server.connect(&token).await;
    assert_eq!(next_frame(&mut first).await.unwrap().to_text().unwrap(), "ready");
    drop(first);

    let connection = server.registry.lookup(&token).await.unwrap();
    for _ in 0..300 {
        if connection.status() == ConnectionStatus::Inactive {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(connection.status(), ConnectionStatus::Inactive);
    assert!(server.registry.lookup(&token).await.is_some());

    let mut second = server.connect(&token).await;
    assert_eq!(
        next_frame(&mut second).await.unwrap().to_text().unwrap(),
        "reconnected"
    );
}

#[tokio::test]
async fn disabled_reconnect_refuses_takeover() {
    let server = TestServer::start(stateful_options(), reconnecting_echo(true)).await;
    let token = server.negotiate(true).await;

    let mut first = server.connect(&token).await;
    assert_eq!(next_frame(&mut first).await.unwrap().to_text().unwrap(), "ready");

    match connect_async(server.url(Some(&token))).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 409),
        Err(err) => panic!("unexpected error: {err}"),
        Ok(_) => panic!("expected a conflict"),
    }
}

#[tokio::test]
async fn dropped_socket_without_reconnect_is_disposed() {
    let server = TestServer::start(HttpConnectionOptions::default(), echo()).await;
    let token = server.negotiate(false).await;

    let client = server.connect(&token).await;
    drop(client);
    server.wait_until_removed(&token).await;
}
