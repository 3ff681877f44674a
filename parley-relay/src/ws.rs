//! WebSocket accept loop.
//!
//! Each accepted socket is split into a writer task draining the session's
//! outbound queue and a reader task feeding its inbound queue. The session
//! itself only sees text frames.

use crate::server::ChatRelay;
use crate::session::Session;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

/// Inbound frames buffered between the socket reader and the session.
const INBOUND_QUEUE: usize = 64;

/// Accept connections until the relay begins shutting down.
pub async fn serve(relay: Arc<ChatRelay>, listener: TcpListener) -> std::io::Result<()> {
    let mut shutdown = relay.shutdown_signal();
    info!(addr = ?listener.local_addr().ok(), "realtime listener started");

    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.wait_for(|stopping| *stopping) => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        if relay.is_shutting_down() {
            relay.metrics().connections_rejected.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        if let Err(e) = relay.rate_limits().check_connection(&addr.ip()) {
            relay.metrics().connections_rejected.fetch_add(1, Ordering::Relaxed);
            debug!(%addr, error = %e, "connection refused");
            continue;
        }

        relay.metrics().connections_total.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(handle_socket(relay.clone(), stream, addr));
    }

    info!("realtime listener stopped");
    Ok(())
}

async fn handle_socket(relay: Arc<ChatRelay>, stream: TcpStream, addr: SocketAddr) {
    let socket = match tokio_tungstenite::accept_async(stream).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!(%addr, error = %e, "websocket upgrade failed");
            return;
        }
    };
    let (mut sink, mut source) = socket.split();

    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<String>(relay.config().server.outbound_queue.max(1));
    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(INBOUND_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(message) = source.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text.as_str().to_owned(),
                Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("dropping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            if inbound_tx.send(text).await.is_err() {
                break;
            }
        }
    });

    let session = Session::new(relay, inbound_rx, outbound_tx);
    let connection_id = session.connection_id();
    match session.run().await {
        Ok(()) => debug!(%addr, connection = %connection_id, "session ended"),
        Err(e) => debug!(%addr, connection = %connection_id, error = %e, "session ended with error"),
    }

    // The session dropped its sender; the router's clone went with unregister.
    reader.abort();
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppCredentials, Config};
    use crate::kv::MemoryStore;
    use crate::storage::SqliteStorage;
    use std::collections::HashMap;
    use std::time::Duration;

    async fn start(config: Config) -> (Arc<ChatRelay>, SocketAddr) {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let relay = Arc::new(ChatRelay::new(config, storage, Arc::new(MemoryStore::new())));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(relay.clone(), listener));
        (relay, addr)
    }

    fn config_with_app() -> Config {
        let mut config = Config::default();
        config.auth.apps.insert(
            "acme".to_string(),
            AppCredentials {
                client_secret: "s3cret".to_string(),
                admin_token: "adm1n".to_string(),
                agents: HashMap::new(),
            },
        );
        config
    }

    async fn next_text<S>(source: &mut S) -> String
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), source.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = message {
                return text.as_str().to_owned();
            }
        }
    }

    #[tokio::test]
    async fn websocket_client_completes_handshake() {
        let (relay, addr) = start(config_with_app()).await;
        let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .unwrap();
        let (mut sink, mut source) = socket.split();

        let open = next_text(&mut source).await;
        assert!(open.starts_with('0'));
        assert!(open.contains("\"sid\""));

        sink.send(Message::Text(
            r#"40{"appId":"acme","deviceId":"d1","token":"s3cret"}"#.into(),
        ))
        .await
        .unwrap();
        let connect = next_text(&mut source).await;
        assert!(connect.starts_with("40{"));

        assert_eq!(relay.metrics().connections_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn connection_flood_is_refused() {
        let mut config = config_with_app();
        config.limits.connections_per_ip = 1;
        let (relay, addr) = start(config).await;

        let (_first, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .unwrap();
        let second = tokio_tungstenite::connect_async(format!("ws://{addr}/")).await;

        assert!(second.is_err());
        assert_eq!(relay.metrics().connections_rejected.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn listener_stops_on_shutdown() {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let relay = Arc::new(ChatRelay::new(
            Config::default(),
            storage,
            Arc::new(MemoryStore::new()),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let task = tokio::spawn(serve(relay.clone(), listener));

        relay.shutdown_all();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
