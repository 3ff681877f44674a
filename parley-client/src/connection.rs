//! One live connection: handshake, writer, reader and heartbeat.
//!
//! ```text
//! emit ─▶ outbound queue ─▶ writer task ─▶ Transport::send
//! Transport::recv ─▶ reader task ─┬▶ AckRegistry (ACK)
//!                                 └▶ signal channel (EVENT, close)
//! heartbeat task: PING every interval, IdleTimeout after silence
//! ```
//!
//! The reader is the only decoder. Every signal carries the generation of
//! the connection that produced it so the supervisor can ignore stragglers
//! from a connection it already replaced.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_types::{
    ConnectAuth, ConnectionId, EventSet, Frame, FrameType, Namespace, OpenHandshake, Packet,
    PacketType, ServerEvent, DEFAULT_MAX_PAYLOAD,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::acks::{AckError, AckRegistry};
use crate::client::ClientError;
use crate::transport::Transport;
use parley_core::IDLE_TIMEOUT;

/// Capacity of the ordered outgoing-frame queue.
const OUTBOUND_CAPACITY: usize = 256;

/// Parameters for opening a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server URL.
    pub url: String,
    /// Namespace to join.
    pub namespace: Namespace,
    /// CONNECT auth payload.
    pub auth: ConnectAuth,
    /// Time allowed from transport open to namespace CONNECT.
    pub handshake_timeout: Duration,
    /// Inbound silence after which the connection is dead.
    pub idle_timeout: Duration,
}

/// Something the connection reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionSignal {
    /// A decoded server event.
    Event(ServerEvent),
    /// The connection is gone.
    Closed {
        /// Why it closed.
        reason: String,
    },
    /// No inbound traffic within the idle timeout.
    IdleTimeout,
}

/// A [`ConnectionSignal`] tagged with its connection generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    /// Generation of the producing connection.
    pub generation: u64,
    /// The signal.
    pub signal: ConnectionSignal,
}

/// An established connection.
pub struct Connection<T: Transport> {
    generation: u64,
    session_id: ConnectionId,
    namespace: Namespace,
    transport: Arc<T>,
    outbound: mpsc::Sender<String>,
    acks: Arc<AckRegistry>,
    last_inbound: Arc<Mutex<Instant>>,
    ping_interval: Duration,
    idle_timeout: Duration,
    signals: mpsc::Sender<Signal>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> Connection<T> {
    /// Open the transport, run the OPEN/CONNECT handshake and start the
    /// writer and reader tasks.
    pub async fn establish(
        transport: Arc<T>,
        config: &ConnectionConfig,
        generation: u64,
        signals: mpsc::Sender<Signal>,
    ) -> Result<Self, ClientError> {
        transport.connect(&config.url).await?;

        let handshake =
            match tokio::time::timeout(config.handshake_timeout, handshake(&*transport, config))
                .await
            {
                Ok(Ok(handshake)) => handshake,
                Ok(Err(e)) => {
                    let _ = transport.close().await;
                    return Err(e);
                }
                Err(_) => {
                    let _ = transport.close().await;
                    return Err(ClientError::ConnectionFailed("handshake timed out".into()));
                }
            };

        info!(
            generation,
            sid = %handshake.sid,
            namespace = %config.namespace,
            "connected"
        );

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let acks = Arc::new(AckRegistry::new());
        let last_inbound = Arc::new(Mutex::new(Instant::now()));

        let writer = tokio::spawn(write_loop(
            Arc::clone(&transport),
            outbound_rx,
            signals.clone(),
            generation,
        ));
        let reader = tokio::spawn(read_loop(ReadContext {
            transport: Arc::clone(&transport),
            outbound: outbound.clone(),
            acks: Arc::clone(&acks),
            last_inbound: Arc::clone(&last_inbound),
            signals: signals.clone(),
            generation,
            namespace: config.namespace,
            max_payload: handshake.max_payload.max(1),
        }));

        Ok(Self {
            generation,
            session_id: handshake.sid,
            namespace: config.namespace,
            transport,
            outbound,
            acks,
            last_inbound,
            ping_interval: Duration::from_millis(handshake.ping_interval.max(1)),
            idle_timeout: config.idle_timeout,
            signals,
            tasks: Mutex::new(vec![writer, reader]),
            heartbeat: Mutex::new(None),
        })
    }

    /// Generation number assigned by the owner.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Session id announced in the OPEN frame.
    pub fn session_id(&self) -> ConnectionId {
        self.session_id
    }

    /// Start pinging and watching for inbound silence.
    pub fn start_heartbeat(&self) {
        let task = tokio::spawn(heartbeat_loop(
            self.outbound.clone(),
            Arc::clone(&self.last_inbound),
            self.signals.clone(),
            self.generation,
            self.ping_interval,
            self.idle_timeout,
        ));
        if let Some(previous) = lock(&self.heartbeat).replace(task) {
            previous.abort();
        }
    }

    /// Stop the heartbeat task.
    pub fn stop_heartbeat(&self) {
        if let Some(task) = lock(&self.heartbeat).take() {
            task.abort();
        }
    }

    /// Fire-and-forget emit.
    pub async fn emit<E: EventSet>(&self, event: &E) -> Result<(), ClientError> {
        let packet = event.to_packet(self.namespace, None)?;
        self.outbound
            .send(Frame::message(&packet).encode())
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// Emit and wait for the server's ACK.
    pub async fn emit_with_ack<E: EventSet>(&self, event: &E) -> Result<Value, ClientError> {
        let pending = self.acks.register()?;
        let packet = match event.to_packet(self.namespace, Some(pending.id)) {
            Ok(packet) => packet,
            Err(e) => {
                self.acks.cancel(pending.id);
                return Err(e.into());
            }
        };
        if self
            .outbound
            .send(Frame::message(&packet).encode())
            .await
            .is_err()
        {
            self.acks.cancel(pending.id);
            return Err(AckError::ConnectionClosed.into());
        }
        Ok(self.acks.wait(pending).await?)
    }

    /// Number of acks still waiting on this connection.
    pub fn pending_acks(&self) -> usize {
        self.acks.pending_count()
    }

    /// Tear the connection down: fail pending acks, stop every task and
    /// close the transport.
    pub async fn shutdown(&self) {
        let failed = self.acks.fail_all();
        self.stop_heartbeat();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        let _ = self.transport.send(Frame::close().encode()).await;
        let _ = self.transport.close().await;
        debug!(
            generation = self.generation,
            failed_acks = failed,
            "connection shut down"
        );
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        self.acks.fail_all();
        if let Some(task) = lock(&self.heartbeat).take() {
            task.abort();
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

fn lock<V>(mutex: &Mutex<V>) -> std::sync::MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn recv_frame<T: Transport>(transport: &T) -> Result<Frame, ClientError> {
    loop {
        let raw = transport.recv().await?;
        match Frame::decode(&raw, DEFAULT_MAX_PAYLOAD) {
            Ok(frame) => return Ok(frame),
            Err(e) => warn!(error = %e, "dropping malformed frame during handshake"),
        }
    }
}

async fn handshake<T: Transport>(
    transport: &T,
    config: &ConnectionConfig,
) -> Result<OpenHandshake, ClientError> {
    let open = loop {
        let frame = recv_frame(transport).await?;
        if frame.frame_type == FrameType::Open {
            break frame.handshake()?;
        }
    };

    let auth = serde_json::to_value(&config.auth)
        .map_err(|e| ClientError::Serialization(e.to_string()))?;
    let connect = Packet::connect(config.namespace, Some(auth));
    transport.send(Frame::message(&connect).encode()).await?;

    loop {
        let frame = recv_frame(transport).await?;
        match frame.frame_type {
            FrameType::Ping => transport.send(Frame::pong(frame.payload).encode()).await?,
            FrameType::Close => return Err(ClientError::ConnectionFailed("closed by server".into())),
            FrameType::Message => {
                let packet = match frame.packet() {
                    Some(Ok(packet)) => packet,
                    Some(Err(e)) => {
                        warn!(error = %e, "dropping malformed packet during handshake");
                        continue;
                    }
                    None => continue,
                };
                if packet.namespace != config.namespace.path() {
                    continue;
                }
                match packet.packet_type {
                    PacketType::Connect => return Ok(open),
                    PacketType::ConnectError => {
                        let reason = packet
                            .data
                            .as_ref()
                            .and_then(|d| d.get("message"))
                            .and_then(Value::as_str)
                            .unwrap_or("connection refused")
                            .to_string();
                        return Err(ClientError::AuthRejected(reason));
                    }
                    _ => {}
                }
            }
            FrameType::Open | FrameType::Pong => {}
        }
    }
}

async fn write_loop<T: Transport>(
    transport: Arc<T>,
    mut outbound: mpsc::Receiver<String>,
    signals: mpsc::Sender<Signal>,
    generation: u64,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = transport.send(frame).await {
            warn!(generation, error = %e, "write failed");
            let _ = signals
                .send(Signal {
                    generation,
                    signal: ConnectionSignal::Closed {
                        reason: e.to_string(),
                    },
                })
                .await;
            return;
        }
    }
}

struct ReadContext<T: Transport> {
    transport: Arc<T>,
    outbound: mpsc::Sender<String>,
    acks: Arc<AckRegistry>,
    last_inbound: Arc<Mutex<Instant>>,
    signals: mpsc::Sender<Signal>,
    generation: u64,
    namespace: Namespace,
    max_payload: usize,
}

enum Flow {
    Continue,
    Stop(String),
}

async fn read_loop<T: Transport>(ctx: ReadContext<T>) {
    let reason = loop {
        let raw = match ctx.transport.recv().await {
            Ok(raw) => raw,
            Err(e) => break e.to_string(),
        };
        *lock(&ctx.last_inbound) = Instant::now();

        let frame = match Frame::decode(&raw, ctx.max_payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(generation = ctx.generation, error = %e, "dropping malformed frame");
                continue;
            }
        };

        let flow = match frame.frame_type {
            FrameType::Ping => {
                let _ = ctx.outbound.try_send(Frame::pong(frame.payload).encode());
                Flow::Continue
            }
            FrameType::Pong | FrameType::Open => Flow::Continue,
            FrameType::Close => Flow::Stop("closed by server".into()),
            FrameType::Message => match frame.packet() {
                Some(Ok(packet)) => dispatch(&ctx, packet).await,
                Some(Err(e)) => {
                    warn!(generation = ctx.generation, error = %e, "dropping malformed packet");
                    Flow::Continue
                }
                None => Flow::Continue,
            },
        };

        if let Flow::Stop(reason) = flow {
            break reason;
        }
    };

    debug!(generation = ctx.generation, %reason, "reader stopped");
    ctx.acks.fail_all();
    let _ = ctx
        .signals
        .send(Signal {
            generation: ctx.generation,
            signal: ConnectionSignal::Closed { reason },
        })
        .await;
}

async fn dispatch<T: Transport>(ctx: &ReadContext<T>, packet: Packet) -> Flow {
    if packet.namespace != ctx.namespace.path() {
        debug!(namespace = %packet.namespace, "ignoring packet for other namespace");
        return Flow::Continue;
    }

    match packet.packet_type {
        PacketType::Ack => {
            if let Some(id) = packet.ack_id {
                ctx.acks.resolve(id, packet.args().to_vec());
            }
            Flow::Continue
        }
        PacketType::Event => {
            let event = match ServerEvent::from_packet(&packet) {
                Ok(event) => event,
                Err(e) => {
                    warn!(generation = ctx.generation, error = %e, "dropping event");
                    return Flow::Continue;
                }
            };
            let signal = Signal {
                generation: ctx.generation,
                signal: ConnectionSignal::Event(event.clone()),
            };
            if event.is_droppable() {
                if ctx.signals.try_send(signal).is_err() {
                    debug!(generation = ctx.generation, "event channel full, dropping low-value event");
                }
                Flow::Continue
            } else if ctx.signals.send(signal).await.is_err() {
                Flow::Stop("client dropped".into())
            } else {
                Flow::Continue
            }
        }
        PacketType::Disconnect => Flow::Stop("disconnected by server".into()),
        PacketType::ConnectError => Flow::Stop("namespace connection revoked".into()),
        PacketType::Connect => Flow::Continue,
    }
}

async fn heartbeat_loop(
    outbound: mpsc::Sender<String>,
    last_inbound: Arc<Mutex<Instant>>,
    signals: mpsc::Sender<Signal>,
    generation: u64,
    ping_interval: Duration,
    idle_timeout: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    loop {
        let deadline = *lock(&last_inbound) + idle_timeout;
        tokio::select! {
            _ = ticker.tick() => {
                if outbound.send(Frame::ping().encode()).await.is_err() {
                    return;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                if lock(&last_inbound).elapsed() >= idle_timeout {
                    warn!(generation, "no inbound traffic, connection considered dead");
                    let _ = signals
                        .send(Signal {
                            generation,
                            signal: ConnectionSignal::IdleTimeout,
                        })
                        .await;
                    return;
                }
            }
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            namespace: Namespace::Client,
            auth: ConnectAuth {
                app_id: "".into(),
                device_id: None,
                agent_id: None,
                token: String::new(),
            },
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: IDLE_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use parley_types::{ClientEvent, ConversationId, ConversationRef, ShutdownNotice};

    fn open_frame() -> String {
        Frame::open(&OpenHandshake {
            sid: ConnectionId::new(),
            upgrades: vec![],
            ping_interval: 25_000,
            ping_timeout: 60_000,
            max_payload: DEFAULT_MAX_PAYLOAD,
        })
        .encode()
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            url: "ws://test".into(),
            auth: ConnectAuth {
                app_id: "acme".into(),
                device_id: Some("d1".into()),
                agent_id: None,
                token: "t".into(),
            },
            ..ConnectionConfig::default()
        }
    }

    /// Server that accepts CONNECT and answers every acked event with `{ok:true}`.
    fn accepting_server() -> MockTransport {
        let transport = MockTransport::new();
        transport.on_every_connect(vec![open_frame()]);
        transport.set_responder(|raw| {
            let Ok(frame) = Frame::decode(raw, DEFAULT_MAX_PAYLOAD) else {
                return vec![];
            };
            match frame.frame_type {
                FrameType::Ping => vec![Frame::pong("").encode()],
                FrameType::Message => match frame.packet() {
                    Some(Ok(p)) if p.packet_type == PacketType::Connect => {
                        vec![Frame::message(&Packet::connect(Namespace::Client, None)).encode()]
                    }
                    Some(Ok(p)) if p.packet_type == PacketType::Event && p.ack_id.is_some() => {
                        let reply = Packet::ack("/", p.ack_id.unwrap(), vec![serde_json::json!({"ok": true, "data": 1})]);
                        vec![Frame::message(&reply).encode()]
                    }
                    _ => vec![],
                },
                _ => vec![],
            }
        });
        transport
    }

    #[tokio::test]
    async fn handshake_sends_auth_in_connect() {
        let transport = Arc::new(accepting_server());
        let (tx, _rx) = mpsc::channel(8);
        let connection = Connection::establish(Arc::clone(&transport), &config(), 1, tx)
            .await
            .unwrap();

        let sent = transport.sent_frames();
        assert!(sent[0].starts_with("40{"));
        assert!(sent[0].contains("\"appId\":\"acme\""));
        assert_eq!(connection.generation(), 1);
    }

    #[tokio::test]
    async fn connect_error_is_auth_rejection() {
        let transport = MockTransport::new();
        transport.on_every_connect(vec![open_frame()]);
        transport.set_responder(|_| {
            vec![Frame::message(&Packet::connect_error("/", "bad token")).encode()]
        });
        let (tx, _rx) = mpsc::channel(8);

        let result = Connection::establish(Arc::new(transport), &config(), 1, tx).await;
        assert!(matches!(result, Err(ClientError::AuthRejected(reason)) if reason == "bad token"));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_times_out_handshake() {
        let transport = MockTransport::new();
        let (tx, _rx) = mpsc::channel(8);
        let result = Connection::establish(Arc::new(transport), &config(), 1, tx).await;
        assert!(matches!(result, Err(ClientError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn emit_with_ack_round_trip() {
        let transport = Arc::new(accepting_server());
        let (tx, _rx) = mpsc::channel(8);
        let connection = Connection::establish(transport, &config(), 1, tx)
            .await
            .unwrap();

        let event = ClientEvent::JoinConversation(ConversationRef {
            conversation_id: ConversationId::new(),
        });
        assert_eq!(
            connection.emit_with_ack(&event).await.unwrap(),
            serde_json::json!(1)
        );
        assert_eq!(connection.pending_acks(), 0);
    }

    #[tokio::test]
    async fn server_events_and_close_are_signalled() {
        let transport = Arc::new(accepting_server());
        let (tx, mut rx) = mpsc::channel(8);
        let _connection = Connection::establish(Arc::clone(&transport), &config(), 7, tx)
            .await
            .unwrap();

        let event = ServerEvent::ServerShutdown(ShutdownNotice {
            reconnect_delay_ms: 500,
        });
        let packet = event.to_packet(Namespace::Client, None).unwrap();
        transport.queue_response("4garbage");
        transport.queue_response(Frame::message(&packet).encode());
        transport.drop_connection();

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            Signal {
                generation: 7,
                signal: ConnectionSignal::Event(event)
            }
        );
        let second = rx.recv().await.unwrap();
        assert!(matches!(second.signal, ConnectionSignal::Closed { .. }));
    }

    #[tokio::test]
    async fn teardown_fails_pending_acks() {
        let transport = MockTransport::new();
        transport.on_every_connect(vec![open_frame()]);
        transport.set_responder(|raw| {
            // Accept CONNECT, never answer events.
            if raw.starts_with("40") {
                vec![Frame::message(&Packet::connect(Namespace::Client, None)).encode()]
            } else {
                vec![]
            }
        });
        let (tx, _rx) = mpsc::channel(8);
        let connection = Arc::new(
            Connection::establish(Arc::new(transport), &config(), 1, tx)
                .await
                .unwrap(),
        );

        let c = Arc::clone(&connection);
        let waiter = tokio::spawn(async move {
            let event = ClientEvent::LeaveConversation(ConversationRef {
                conversation_id: ConversationId::new(),
            });
            c.emit_with_ack(&event).await
        });
        while connection.pending_acks() == 0 {
            tokio::task::yield_now().await;
        }
        connection.shutdown().await;

        assert!(matches!(
            waiter.await.unwrap(),
            Err(ClientError::Ack(AckError::ConnectionClosed))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_is_reported() {
        let transport = MockTransport::new();
        transport.on_every_connect(vec![open_frame()]);
        // Accept CONNECT but never answer pings.
        transport.set_responder(|raw| {
            if raw.starts_with("40") {
                vec![Frame::message(&Packet::connect(Namespace::Client, None)).encode()]
            } else {
                vec![]
            }
        });
        let (tx, mut rx) = mpsc::channel(8);
        let connection = Connection::establish(Arc::new(transport), &config(), 3, tx)
            .await
            .unwrap();
        connection.start_heartbeat();

        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.signal, ConnectionSignal::IdleTimeout);
    }
}
