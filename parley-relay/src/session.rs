//! Per-connection session management.
//!
//! Each connection gets a Session that speaks the framing protocol over a
//! pair of text channels: it sends OPEN, waits for a namespace CONNECT,
//! authenticates, then dispatches typed events until the peer disconnects,
//! goes silent for longer than the ping timeout, or the relay shuts down.
//! Malformed frames are dropped and counted; the connection survives them.

use crate::error::{ProtocolError, ProtocolResult, RelayError};
use crate::server::{ChatRelay, Peer};
use parley_types::{
    AckReply, AdminEvent, ClientEvent, ConnectAuth, ConnectionId, ErrorKind, EventSet, Frame,
    FrameType, Namespace, OpenHandshake, Packet, PacketType, RemoteError,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Session state machine states.
#[derive(Debug, Clone)]
pub enum SessionState {
    /// OPEN sent, waiting for CONNECT.
    AwaitingConnect,
    /// Authenticated and attached to the relay.
    Active(Peer),
    /// Session is closing.
    Closing,
}

/// A per-connection session.
pub struct Session {
    relay: Arc<ChatRelay>,
    connection_id: ConnectionId,
    inbound: mpsc::Receiver<String>,
    outbound: mpsc::Sender<String>,
    state: SessionState,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection_id", &self.connection_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl Session {
    /// Create a new session over raw text frames.
    ///
    /// `outbound` is also handed to the router, so its capacity bounds how
    /// many broadcast frames may queue up for a slow peer.
    pub fn new(
        relay: Arc<ChatRelay>,
        inbound: mpsc::Receiver<String>,
        outbound: mpsc::Sender<String>,
    ) -> Self {
        Self {
            relay,
            connection_id: ConnectionId::new(),
            inbound,
            outbound,
            state: SessionState::AwaitingConnect,
        }
    }

    /// Connection id announced in OPEN.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Run the session until completion.
    pub async fn run(mut self) -> Result<(), RelayError> {
        let server = self.relay.config().server.clone();
        self.send(Frame::open(&OpenHandshake {
            sid: self.connection_id,
            upgrades: Vec::new(),
            ping_interval: server.ping_interval_ms,
            ping_timeout: server.ping_timeout_ms,
            max_payload: server.max_payload,
        }))
        .await?;

        let peer = match timeout(server.handshake_timeout(), self.await_connect()).await {
            Ok(Ok(Some(peer))) => peer,
            Ok(Ok(None)) => {
                tracing::debug!(connection = %self.connection_id, "closed before CONNECT");
                return Ok(());
            }
            Ok(Err(e)) => {
                let _ = self.send(Frame::close()).await;
                return Err(e.into());
            }
            Err(_) => {
                tracing::warn!(connection = %self.connection_id, "CONNECT timeout");
                let _ = self.send(Frame::close()).await;
                return Err(ProtocolError::HandshakeTimeout.into());
            }
        };

        if let Err(e) = self.relay.attach(&peer, self.outbound.clone()).await {
            tracing::error!(connection = %self.connection_id, error = %e, "attach failed");
            // Undo whatever part of the attach went through.
            if let Err(cleanup) = self.relay.detach(&peer).await {
                tracing::error!(connection = %self.connection_id, error = %cleanup, "detach failed");
            }
            let _ = self.send(Frame::close()).await;
            return Err(e);
        }
        self.state = SessionState::Active(peer.clone());

        let result = self.serve(&peer).await;
        self.state = SessionState::Closing;

        if let Err(e) = self.relay.detach(&peer).await {
            tracing::error!(connection = %self.connection_id, error = %e, "detach failed");
        }
        result.map_err(Into::into)
    }

    /// Wait for a valid CONNECT. `None` means the transport went away.
    async fn await_connect(&mut self) -> ProtocolResult<Option<Peer>> {
        let max_payload = self.relay.config().server.max_payload;
        while let Some(raw) = self.inbound.recv().await {
            let frame = match Frame::decode(&raw, max_payload) {
                Ok(frame) => frame,
                Err(e) => {
                    self.malformed(&e);
                    continue;
                }
            };
            let packet = match frame.frame_type {
                FrameType::Ping => {
                    self.send(Frame::pong(frame.payload)).await?;
                    continue;
                }
                FrameType::Close => return Ok(None),
                FrameType::Message => match Packet::decode(&frame.payload) {
                    Ok(packet) => packet,
                    Err(e) => {
                        self.malformed(&e);
                        continue;
                    }
                },
                FrameType::Open | FrameType::Pong => continue,
            };

            if packet.packet_type != PacketType::Connect {
                tracing::debug!(connection = %self.connection_id, "packet before CONNECT ignored");
                continue;
            }
            let Some(namespace) = Namespace::from_path(&packet.namespace) else {
                self.send_packet(&Packet::connect_error(&packet.namespace, "Invalid namespace"))
                    .await?;
                continue;
            };

            let auth: ConnectAuth = match packet
                .data
                .clone()
                .map(serde_json::from_value)
                .transpose()
            {
                Ok(Some(auth)) => auth,
                Ok(None) | Err(_) => {
                    self.reject(namespace, "invalid auth payload").await?;
                    return Err(ProtocolError::UnexpectedPacket(
                        "CONNECT without auth payload".into(),
                    ));
                }
            };

            let identity = match self.relay.authenticator().authenticate(namespace, &auth).await {
                Ok(identity) => identity,
                Err(e) => {
                    self.relay
                        .metrics()
                        .auth_failures
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        connection = %self.connection_id,
                        app = %auth.app_id,
                        error = %e,
                        "authentication failed"
                    );
                    self.reject(namespace, &e.to_string()).await?;
                    return Err(e.into());
                }
            };

            self.send_packet(&Packet::connect(
                namespace,
                Some(serde_json::json!({ "sid": self.connection_id })),
            ))
            .await?;
            return Ok(Some(Peer {
                connection_id: self.connection_id,
                identity,
                connected_at: now_millis(),
            }));
        }
        Ok(None)
    }

    async fn reject(&self, namespace: Namespace, message: &str) -> ProtocolResult<()> {
        self.send_packet(&Packet::connect_error(namespace.path(), message))
            .await
    }

    /// Main loop of an authenticated connection.
    async fn serve(&mut self, peer: &Peer) -> ProtocolResult<()> {
        let idle = self.relay.config().server.ping_timeout();
        let mut shutdown = self.relay.shutdown_signal();
        if self.relay.is_shutting_down() {
            return self.send(Frame::close()).await;
        }

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!(connection = %self.connection_id, "closing for shutdown");
                        return self.send(Frame::close()).await;
                    }
                }
                next = timeout(idle, self.inbound.recv()) => match next {
                    Err(_) => {
                        tracing::info!(connection = %self.connection_id, "ping timeout");
                        return Ok(());
                    }
                    Ok(None) => return Ok(()),
                    Ok(Some(raw)) => {
                        if !self.handle_frame(peer, &raw).await? {
                            return Ok(());
                        }
                    }
                },
            }
        }
    }

    /// Handle one inbound frame. Returns `false` when the session should end.
    async fn handle_frame(&mut self, peer: &Peer, raw: &str) -> ProtocolResult<bool> {
        let max_payload = self.relay.config().server.max_payload;
        let frame = match Frame::decode(raw, max_payload) {
            Ok(frame) => frame,
            Err(e) => {
                self.malformed(&e);
                return Ok(true);
            }
        };

        match frame.frame_type {
            FrameType::Ping => {
                self.send(Frame::pong(frame.payload)).await?;
                if let Err(e) = self.relay.heartbeat(peer).await {
                    tracing::warn!(connection = %self.connection_id, error = %e, "presence refresh failed");
                }
                Ok(true)
            }
            FrameType::Close => Ok(false),
            FrameType::Open | FrameType::Pong => Ok(true),
            FrameType::Message => match Packet::decode(&frame.payload) {
                Ok(packet) => self.handle_packet(peer, packet).await,
                Err(e) => {
                    self.malformed(&e);
                    Ok(true)
                }
            },
        }
    }

    async fn handle_packet(&mut self, peer: &Peer, packet: Packet) -> ProtocolResult<bool> {
        let namespace = peer.identity.namespace();
        if packet.namespace != namespace.path() {
            tracing::debug!(
                connection = %self.connection_id,
                namespace = %packet.namespace,
                "packet for another namespace ignored"
            );
            return Ok(true);
        }

        match packet.packet_type {
            PacketType::Disconnect => Ok(false),
            PacketType::Event => {
                self.handle_event(peer, namespace, packet).await?;
                Ok(true)
            }
            PacketType::Connect => {
                tracing::debug!(connection = %self.connection_id, "repeated CONNECT ignored");
                Ok(true)
            }
            PacketType::Ack | PacketType::ConnectError => Ok(true),
        }
    }

    async fn handle_event(
        &mut self,
        peer: &Peer,
        namespace: Namespace,
        packet: Packet,
    ) -> ProtocolResult<()> {
        if let Err(e) = self.relay.rate_limits().check_event(&self.connection_id) {
            self.relay
                .metrics()
                .rate_limit_hits
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(connection = %self.connection_id, error = %e, "event rate limited");
            if let Some(ack_id) = packet.ack_id {
                let reply =
                    AckReply::failure(RemoteError::new(ErrorKind::RateLimited, e.to_string()));
                self.ack(namespace, ack_id, &reply).await?;
            }
            return Ok(());
        }

        let reply = match namespace {
            Namespace::Client => match ClientEvent::from_packet(&packet) {
                Ok(event) => self.relay.handle_client_event(peer, event).await,
                Err(e) => self.invalid(&e),
            },
            Namespace::Admin => match AdminEvent::from_packet(&packet) {
                Ok(event) => self.relay.handle_admin_event(peer, event).await,
                Err(e) => self.invalid(&e),
            },
        };

        match packet.ack_id {
            Some(ack_id) => self.ack(namespace, ack_id, &reply).await,
            None => {
                if let Some(error) = &reply.error {
                    tracing::debug!(connection = %self.connection_id, error = %error, "unacknowledged event failed");
                }
                Ok(())
            }
        }
    }

    fn invalid(&self, error: &parley_types::CodecError) -> AckReply {
        self.malformed(error);
        AckReply::failure(RemoteError::new(ErrorKind::InvalidRequest, error.to_string()))
    }

    fn malformed(&self, error: &parley_types::CodecError) {
        self.relay
            .metrics()
            .malformed_frames
            .fetch_add(1, Ordering::Relaxed);
        tracing::warn!(connection = %self.connection_id, error = %error, "dropping malformed frame");
    }

    async fn ack(&self, namespace: Namespace, ack_id: u64, reply: &AckReply) -> ProtocolResult<()> {
        self.send_packet(&Packet::ack(namespace.path(), ack_id, reply.to_args()))
            .await
    }

    async fn send_packet(&self, packet: &Packet) -> ProtocolResult<()> {
        self.send(Frame::message(packet)).await
    }

    async fn send(&self, frame: Frame) -> ProtocolResult<()> {
        self.outbound
            .send(frame.encode())
            .await
            .map_err(|_| ProtocolError::Connection("outbound channel closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppCredentials, Config};
    use crate::kv::MemoryStore;
    use crate::error::StorageError;
    use crate::storage::{
        Conversation, MessageStore, SqliteStorage, StoreMessageRequest, StoreOutcome,
    };
    use parley_types::{
        AppId, ChatMessage, ConversationId, DeviceId, LocalId, SendReply, Sequence, ServerEvent,
        ServerId,
    };
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct Harness {
        to_server: mpsc::Sender<String>,
        from_server: mpsc::Receiver<String>,
        task: JoinHandle<Result<(), RelayError>>,
    }

    impl Harness {
        async fn frame(&mut self) -> Frame {
            let raw = timeout(Duration::from_secs(5), self.from_server.recv())
                .await
                .expect("no frame from server")
                .expect("server hung up");
            Frame::decode(&raw, usize::MAX).unwrap()
        }

        async fn packet(&mut self) -> Packet {
            self.frame().await.packet().unwrap().unwrap()
        }

        async fn send(&self, raw: impl Into<String>) {
            self.to_server.send(raw.into()).await.unwrap();
        }

        async fn send_packet(&self, packet: &Packet) {
            self.send(Frame::message(packet).encode()).await;
        }

        async fn connect_user(&mut self, token: &str) -> Packet {
            let open = self.frame().await;
            assert_eq!(open.frame_type, FrameType::Open);
            self.send_packet(&Packet::connect(
                Namespace::Client,
                Some(json!({ "appId": "acme", "deviceId": "d1", "token": token })),
            ))
            .await;
            self.packet().await
        }
    }

    fn test_config() -> Config {
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

    async fn relay(config: Config) -> Arc<ChatRelay> {
        let store = Arc::new(SqliteStorage::in_memory().await.unwrap());
        Arc::new(ChatRelay::new(config, store, Arc::new(MemoryStore::new())))
    }

    fn start(relay: Arc<ChatRelay>) -> Harness {
        let (to_server, inbound) = mpsc::channel(16);
        let (outbound, from_server) = mpsc::channel(16);
        let task = tokio::spawn(Session::new(relay, inbound, outbound).run());
        Harness {
            to_server,
            from_server,
            task,
        }
    }

    fn send_event(body: &str, ack_id: Option<u64>) -> Packet {
        Packet::event(
            Namespace::Client,
            "send_message",
            vec![json!({ "localId": LocalId::new(), "body": body })],
            ack_id,
        )
    }

    #[tokio::test]
    async fn handshake_announces_session() {
        let relay = relay(test_config()).await;
        let mut h = start(relay.clone());

        let open = h.frame().await;
        let handshake = open.handshake().unwrap();
        assert_eq!(handshake.ping_interval, 25_000);
        assert_eq!(handshake.ping_timeout, 60_000);
        assert!(handshake.upgrades.is_empty());

        h.send_packet(&Packet::connect(
            Namespace::Client,
            Some(json!({ "appId": "acme", "deviceId": "d1", "token": "s3cret" })),
        ))
        .await;
        let ack = h.packet().await;
        assert_eq!(ack.packet_type, PacketType::Connect);
        assert_eq!(ack.namespace, "/");
        assert_eq!(ack.data, Some(json!({ "sid": handshake.sid })));

        assert!(relay
            .presence()
            .is_online(&"acme".into(), &"d1".into())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn rejected_credentials_end_the_session() {
        let relay = relay(test_config()).await;
        let mut h = start(relay.clone());

        let reply = h.connect_user("wrong").await;
        assert_eq!(reply.packet_type, PacketType::ConnectError);
        assert_eq!(reply.data, Some(json!({ "message": "invalid token" })));

        let result = h.task.await.unwrap();
        assert!(matches!(
            result,
            Err(RelayError::Protocol(ProtocolError::Auth(_)))
        ));
        assert_eq!(relay.metrics().auth_failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unknown_namespace_gets_connect_error() {
        let mut h = start(relay(test_config()).await);
        h.frame().await;

        h.send(r#"40/billing,{"appId":"acme","token":"s3cret"}"#).await;
        let reply = h.packet().await;
        assert_eq!(reply.packet_type, PacketType::ConnectError);
        assert_eq!(reply.namespace, "/billing");

        // The transport stays open for a valid CONNECT.
        let ack = h.connect_user("s3cret").await;
        assert_eq!(ack.packet_type, PacketType::Connect);
    }

    #[tokio::test]
    async fn missing_connect_times_out() {
        let mut config = test_config();
        config.server.handshake_timeout_secs = 1;
        let relay = relay(config).await;
        let mut h = start(relay);
        h.frame().await;

        let result = h.task.await.unwrap();
        assert!(matches!(
            result,
            Err(RelayError::Protocol(ProtocolError::HandshakeTimeout))
        ));
    }

    #[tokio::test]
    async fn acked_event_gets_reply() {
        let mut h = start(relay(test_config()).await);
        h.connect_user("s3cret").await;

        h.send_packet(&send_event("hello", Some(0))).await;

        // conversation_joined for the new conversation, its new_message, then the ACK.
        let mut ack = h.packet().await;
        while ack.packet_type != PacketType::Ack {
            ack = h.packet().await;
        }
        assert_eq!(ack.ack_id, Some(0));
        let reply = AckReply::from_args(ack.args()).unwrap();
        let sent: SendReply = serde_json::from_value(reply.into_result().unwrap()).unwrap();
        assert_eq!(sent.message.body, "hello");
    }

    #[tokio::test]
    async fn malformed_frames_are_survived() {
        let relay = relay(test_config()).await;
        let mut h = start(relay.clone());
        h.connect_user("s3cret").await;

        h.send("9garbage").await;
        h.send("42[\"send_message\"").await;
        h.send_packet(&Packet::event(Namespace::Client, "no_such_event", vec![], Some(7)))
            .await;

        let ack = h.packet().await;
        assert_eq!(ack.ack_id, Some(7));
        let error = AckReply::from_args(ack.args())
            .unwrap()
            .into_result()
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::InvalidRequest);
        assert_eq!(relay.metrics().malformed_frames.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let mut h = start(relay(test_config()).await);
        h.connect_user("s3cret").await;

        h.send("2probe").await;
        let pong = h.frame().await;
        assert_eq!(pong.frame_type, FrameType::Pong);
        assert_eq!(pong.payload, "probe");
    }

    #[tokio::test]
    async fn rate_limited_event_is_refused() {
        let mut config = test_config();
        config.limits.events_per_minute = 1;
        let relay = relay(config).await;
        let mut h = start(relay.clone());
        h.connect_user("s3cret").await;

        let sync = |ack_id| {
            Packet::event(
                Namespace::Client,
                "sync",
                vec![json!({ "conversationId": parley_types::ConversationId::new(), "afterSequence": 0 })],
                Some(ack_id),
            )
        };
        h.send_packet(&sync(1)).await;
        h.send_packet(&sync(2)).await;

        let first = h.packet().await;
        let second = h.packet().await;
        assert_eq!(first.ack_id, Some(1));
        let error = AckReply::from_args(second.args())
            .unwrap()
            .into_result()
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::RateLimited);
        assert_eq!(relay.metrics().rate_limit_hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn disconnect_packet_removes_presence() {
        let relay = relay(test_config()).await;
        let mut h = start(relay.clone());
        h.connect_user("s3cret").await;

        h.send_packet(&Packet::disconnect(Namespace::Client)).await;
        h.task.await.unwrap().unwrap();

        assert!(!relay
            .presence()
            .is_online(&"acme".into(), &"d1".into())
            .await
            .unwrap());
        assert_eq!(relay.router().connection_count(), 0);
    }

    /// Storage that cannot look up a device's conversations.
    struct NoLookupStore(SqliteStorage);

    #[async_trait::async_trait]
    impl MessageStore for NoLookupStore {
        async fn create_conversation(
            &self,
            app_id: &AppId,
            device_id: &DeviceId,
        ) -> Result<Conversation, StorageError> {
            self.0.create_conversation(app_id, device_id).await
        }

        async fn get_conversation(
            &self,
            id: &ConversationId,
        ) -> Result<Option<Conversation>, StorageError> {
            self.0.get_conversation(id).await
        }

        async fn latest_conversation(
            &self,
            _app_id: &AppId,
            _device_id: &DeviceId,
        ) -> Result<Option<Conversation>, StorageError> {
            Err(StorageError::CorruptRow("conversations unreadable".into()))
        }

        async fn store_message(
            &self,
            req: StoreMessageRequest,
        ) -> Result<StoreOutcome, StorageError> {
            self.0.store_message(req).await
        }

        async fn messages_after(
            &self,
            conversation_id: &ConversationId,
            after: Sequence,
            limit: u32,
        ) -> Result<Vec<ChatMessage>, StorageError> {
            self.0.messages_after(conversation_id, after, limit).await
        }

        async fn mark_delivered(
            &self,
            server_ids: &[ServerId],
            device_id: &DeviceId,
        ) -> Result<u64, StorageError> {
            self.0.mark_delivered(server_ids, device_id).await
        }

        async fn is_delivered(
            &self,
            server_id: ServerId,
            device_id: &DeviceId,
        ) -> Result<bool, StorageError> {
            self.0.is_delivered(server_id, device_id).await
        }

        async fn total_messages(&self) -> Result<u64, StorageError> {
            self.0.total_messages().await
        }
    }

    #[tokio::test]
    async fn failed_attach_releases_connection() {
        let store = NoLookupStore(SqliteStorage::in_memory().await.unwrap());
        let relay = Arc::new(ChatRelay::new(
            test_config(),
            Arc::new(store),
            Arc::new(MemoryStore::new()),
        ));
        let mut h = start(relay.clone());

        let ack = h.connect_user("s3cret").await;
        assert_eq!(ack.packet_type, PacketType::Connect);

        let result = timeout(Duration::from_secs(5), h.task).await.unwrap().unwrap();
        assert!(matches!(result, Err(RelayError::Storage(_))));
        assert_eq!(relay.router().connection_count(), 0);
        assert!(!relay
            .presence()
            .is_online(&"acme".into(), &"d1".into())
            .await
            .unwrap());
        assert!(relay
            .presence()
            .list_sessions(&"acme".into())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn shutdown_announces_and_closes() {
        let relay = relay(test_config()).await;
        let mut h = start(relay.clone());
        h.connect_user("s3cret").await;

        relay.shutdown_all();

        let notice = h.packet().await;
        let event = ServerEvent::from_packet(&notice).unwrap();
        assert!(matches!(event, ServerEvent::ServerShutdown(n) if n.reconnect_delay_ms == 250));
        assert_eq!(h.frame().await.frame_type, FrameType::Close);
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let mut config = test_config();
        config.server.ping_timeout_ms = 200;
        let relay = relay(config).await;
        let mut h = start(relay.clone());
        h.connect_user("s3cret").await;

        h.task.await.unwrap().unwrap();
        assert_eq!(relay.router().connection_count(), 0);
    }

    #[tokio::test]
    async fn admin_connect_needs_admin_token() {
        let mut h = start(relay(test_config()).await);
        h.frame().await;

        h.send_packet(&Packet::connect(
            Namespace::Admin,
            Some(json!({ "appId": "acme", "agentId": "a7", "token": "adm1n" })),
        ))
        .await;
        let ack = h.packet().await;
        assert_eq!(ack.packet_type, PacketType::Connect);
        assert_eq!(ack.namespace, "/admin");

        h.send_packet(&Packet::event(
            Namespace::Admin,
            "list_sessions",
            vec![json!({})],
            Some(3),
        ))
        .await;
        let reply = h.packet().await;
        let data = AckReply::from_args(reply.args()).unwrap().into_result().unwrap();
        assert_eq!(data["sessions"], Value::Array(vec![]));
    }
}
