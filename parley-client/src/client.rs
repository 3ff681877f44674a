//! ChatClient - the main interface for Parley.
//!
//! This module provides [`ChatClient`], the primary API for applications
//! to exchange chat messages over the Parley realtime protocol.
//!
//! # Architecture
//!
//! ChatClient uses a pure state machine (from parley-core) for lifecycle
//! logic. A single supervisor task feeds it events and interprets the
//! resulting actions; all I/O goes through the Transport trait.
//!
//! ```text
//! Application → ChatClient → supervisor → Connection → Transport → Network
//!                                ↓
//!                  parley-core (state machine, outbox, sync)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use parley_client::{ChatClient, ClientConfig, DefaultPlatform, WsTransport};
//!
//! let config = ClientConfig::new("ws://localhost:8080/socket", "acme", "device-1", "secret");
//! let (client, mut notifications) = ChatClient::new(config, WsTransport::new(), DefaultPlatform);
//!
//! client.connect()?;
//! client.send_message(None, "Hello!")?;
//! while let Some(notification) = notifications.recv().await {
//!     println!("{notification:?}");
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_core::{
    Action, Applied, ConnectionMachine, ConnectionState, Event,
    LifecycleEvent, Outbox, OutboxError, OutgoingMessage, SyncState, IDLE_TIMEOUT,
};
use parley_types::{
    ChatMessage, ClientEvent, CodecError, ConnectAuth, ConversationId, ConversationJoined,
    ConversationRef, DeliveryNotice, DeliveryReceipt, DeliveryStatus, JoinReply, LocalId,
    Namespace, PresenceNotice, SendMessage, SendReply, Sequence, ServerEvent, SyncReply,
    SyncRequest, TypingNotice, TypingUpdate,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::acks::AckError;
use crate::connection::{Connection, ConnectionConfig, ConnectionSignal, Signal};
use crate::platform::Platform;
use crate::transport::{Transport, TransportError};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame or event could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Acked request failed.
    #[error(transparent)]
    Ack(#[from] AckError),

    /// Outbox rejected the operation.
    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Not connected to the server.
    #[error("not connected")]
    NotConnected,

    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The server refused the credentials.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The client has been shut down.
    #[error("client closed")]
    Closed,
}

/// Configuration for ChatClient.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the server.
    pub url: String,
    /// Credentials sent in the CONNECT packet.
    pub auth: ConnectAuth,
    /// Time allowed from transport open to namespace CONNECT.
    pub handshake_timeout: Duration,
    /// Inbound silence after which the connection is dead.
    pub idle_timeout: Duration,
    /// Maximum outbox entries.
    pub outbox_capacity: usize,
    /// Capacity of the notification channel handed to the application.
    pub notification_buffer: usize,
    /// Page size requested when resyncing (0 = server default).
    pub sync_page_size: u32,
}

impl ClientConfig {
    /// Create a configuration for an end-user device.
    pub fn new(url: &str, app_id: &str, device_id: &str, token: &str) -> Self {
        Self {
            url: url.to_string(),
            auth: ConnectAuth {
                app_id: app_id.into(),
                device_id: Some(device_id.into()),
                agent_id: None,
                token: token.to_string(),
            },
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: IDLE_TIMEOUT,
            outbox_capacity: parley_core::DEFAULT_CAPACITY,
            notification_buffer: 256,
            sync_page_size: 100,
        }
    }

    /// Set the outbox capacity.
    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity;
        self
    }

    /// Set the notification channel capacity.
    pub fn with_notification_buffer(mut self, capacity: usize) -> Self {
        self.notification_buffer = capacity.max(1);
        self
    }

    /// Set the resync page size.
    pub fn with_sync_page_size(mut self, limit: u32) -> Self {
        self.sync_page_size = limit;
        self
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            url: self.url.clone(),
            namespace: Namespace::Client,
            auth: self.auth.clone(),
            handshake_timeout: self.handshake_timeout,
            idle_timeout: self.idle_timeout,
        }
    }
}

/// Notifications delivered to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotification {
    /// Connection lifecycle change.
    Lifecycle(LifecycleEvent),
    /// The connection is now in a conversation room.
    ConversationJoined(ConversationJoined),
    /// Next message of a conversation, in sequence order.
    Message(ChatMessage),
    /// An outbox entry was stored by the server.
    Sent {
        /// Local id of the outbox entry.
        local_id: LocalId,
        /// The stored message.
        message: ChatMessage,
    },
    /// An outbox entry exhausted its attempts and needs a manual retry.
    Failed(OutgoingMessage),
    /// Typing indicator.
    Typing(TypingNotice),
    /// Device presence change.
    Presence(PresenceNotice),
    /// Delivery receipts.
    Delivered(DeliveryNotice),
}

impl ClientNotification {
    fn is_droppable(&self) -> bool {
        matches!(self, Self::Typing(_) | Self::Presence(_))
    }
}

enum Command<T: Transport> {
    Machine(Event),
    Established {
        generation: u64,
        connection: Arc<Connection<T>>,
    },
    EstablishFailed {
        generation: u64,
        error: ClientError,
    },
    Drain,
    Resync(Option<ConversationId>),
    Shutdown,
}

/// The main chat client.
///
/// An explicit context object: create as many as needed, each with its own
/// transport, outbox and sync state.
pub struct ChatClient<T: Transport> {
    shared: Arc<Shared<T>>,
    supervisor: JoinHandle<()>,
}

struct Shared<T: Transport> {
    config: ClientConfig,
    transport: Arc<T>,
    platform: Arc<dyn Platform>,
    machine: Mutex<ConnectionMachine>,
    connection: Mutex<Option<Arc<Connection<T>>>>,
    outbox: Mutex<Outbox>,
    sync: Mutex<SyncState>,
    generation: AtomicU64,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
    drain_lock: tokio::sync::Mutex<()>,
    notifications: mpsc::Sender<ClientNotification>,
    commands: mpsc::UnboundedSender<Command<T>>,
    signals: mpsc::Sender<Signal>,
}

impl<T: Transport> ChatClient<T> {
    /// Create a client and the channel its notifications arrive on.
    ///
    /// Must be called inside a tokio runtime. The client stays
    /// disconnected until [`connect`](Self::connect).
    pub fn new<P: Platform>(
        config: ClientConfig,
        transport: T,
        platform: P,
    ) -> (Self, mpsc::Receiver<ClientNotification>) {
        let (notifications, notifications_rx) = mpsc::channel(config.notification_buffer.max(1));
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (signals, signals_rx) = mpsc::channel(config.notification_buffer.max(1));

        let shared = Arc::new(Shared {
            outbox: Mutex::new(Outbox::new(config.outbox_capacity)),
            config,
            transport: Arc::new(transport),
            platform: Arc::new(platform),
            machine: Mutex::new(ConnectionMachine::new()),
            connection: Mutex::new(None),
            sync: Mutex::new(SyncState::new()),
            generation: AtomicU64::new(0),
            reconnect_timer: Mutex::new(None),
            drain_lock: tokio::sync::Mutex::new(()),
            notifications,
            commands,
            signals,
        });

        let supervisor = tokio::spawn(supervise(Arc::clone(&shared), commands_rx, signals_rx));
        (Self { shared, supervisor }, notifications_rx)
    }

    /// Start connecting. Progress is reported through notifications.
    pub fn connect(&self) -> Result<(), ClientError> {
        self.shared.command(Command::Machine(Event::ConnectRequested))
    }

    /// Disconnect and stop reconnecting.
    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.shared
            .command(Command::Machine(Event::DisconnectRequested))
    }

    /// App moved to the background: disconnect and cancel all timers.
    pub fn pause(&self) -> Result<(), ClientError> {
        self.shared.command(Command::Machine(Event::PauseRequested))
    }

    /// App returned to the foreground: connect again.
    pub fn resume(&self) -> Result<(), ClientError> {
        self.connect()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.machine).state()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Queue a message. It is sent immediately when connected, otherwise on
    /// the next connection. `None` starts a new conversation.
    pub fn send_message(
        &self,
        conversation: Option<ConversationId>,
        body: &str,
    ) -> Result<LocalId, ClientError> {
        let local_id = lock(&self.shared.outbox).enqueue(OutgoingMessage::new(conversation, body))?;
        debug!(%local_id, "message queued");
        self.shared.command(Command::Drain)?;
        Ok(local_id)
    }

    /// Manually retry a FAILED message.
    pub fn retry(&self, local_id: &LocalId) -> Result<(), ClientError> {
        lock(&self.shared.outbox).retry(local_id)?;
        self.shared.command(Command::Drain)
    }

    /// Messages waiting for a manual retry.
    pub fn failed_messages(&self) -> Vec<OutgoingMessage> {
        lock(&self.shared.outbox).failed()
    }

    /// Number of messages not yet stored by the server.
    pub fn outbox_len(&self) -> usize {
        lock(&self.shared.outbox).len()
    }

    /// Switch to a conversation room.
    pub async fn join_conversation(
        &self,
        conversation: ConversationId,
    ) -> Result<JoinReply, ClientError> {
        let connection = self.shared.current_connection().ok_or(ClientError::NotConnected)?;
        let reply: JoinReply = decode_reply(
            connection
                .emit_with_ack(&ClientEvent::JoinConversation(ConversationRef {
                    conversation_id: conversation,
                }))
                .await?,
        )?;
        self.shared
            .command(Command::Machine(Event::RoomJoined { conversation }))?;
        self.shared.command(Command::Resync(Some(conversation)))?;
        Ok(reply)
    }

    /// Leave a conversation room.
    pub async fn leave_conversation(&self, conversation: ConversationId) -> Result<(), ClientError> {
        let connection = self.shared.current_connection().ok_or(ClientError::NotConnected)?;
        connection
            .emit_with_ack(&ClientEvent::LeaveConversation(ConversationRef {
                conversation_id: conversation,
            }))
            .await?;
        Ok(())
    }

    /// Report typing state. Silently skipped while offline.
    pub async fn set_typing(
        &self,
        conversation: ConversationId,
        is_typing: bool,
    ) -> Result<(), ClientError> {
        match self.shared.current_connection() {
            Some(connection) => {
                connection
                    .emit(&ClientEvent::Typing(TypingUpdate {
                        conversation_id: conversation,
                        is_typing,
                    }))
                    .await
            }
            None => Ok(()),
        }
    }

    /// Fetch everything after the stored cursor of `conversation`.
    pub fn resync(&self, conversation: ConversationId) -> Result<(), ClientError> {
        self.shared.command(Command::Resync(Some(conversation)))
    }

    /// Resync cursor of a conversation.
    pub fn cursor(&self, conversation: ConversationId) -> Sequence {
        lock(&self.shared.sync).conversation(conversation).cursor()
    }

    /// Restore a cursor persisted by the application.
    pub fn restore_cursor(&self, conversation: ConversationId, cursor: Sequence) {
        lock(&self.shared.sync).restore(conversation, cursor);
    }

    /// Get a reference to the underlying transport (for testing).
    pub fn transport(&self) -> &T {
        &self.shared.transport
    }
}

impl<T: Transport> Drop for ChatClient<T> {
    fn drop(&mut self) {
        if self.shared.commands.send(Command::Shutdown).is_err() {
            self.supervisor.abort();
        }
    }
}

fn lock<V>(mutex: &Mutex<V>) -> std::sync::MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn decode_reply<R: DeserializeOwned>(value: Value) -> Result<R, ClientError> {
    serde_json::from_value(value).map_err(|e| ClientError::Serialization(e.to_string()))
}

async fn supervise<T: Transport>(
    shared: Arc<Shared<T>>,
    mut commands: mpsc::UnboundedReceiver<Command<T>>,
    mut signals: mpsc::Receiver<Signal>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                None | Some(Command::Shutdown) => break,
                Some(command) => shared.handle_command(command).await,
            },
            Some(signal) = signals.recv() => shared.handle_signal(signal).await,
        }
    }

    if let Some(timer) = lock(&shared.reconnect_timer).take() {
        timer.abort();
    }
    let connection = lock(&shared.connection).take();
    if let Some(connection) = connection {
        connection.shutdown().await;
    }
    debug!("client supervisor stopped");
}

impl<T: Transport> Shared<T> {
    fn command(&self, command: Command<T>) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }

    fn current_connection(&self) -> Option<Arc<Connection<T>>> {
        lock(&self.connection).clone()
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    async fn notify(&self, notification: ClientNotification) {
        if notification.is_droppable() {
            if self.notifications.try_send(notification).is_err() {
                debug!("notification channel full, dropping low-value notification");
            }
        } else if self.notifications.send(notification).await.is_err() {
            debug!("application dropped the notification receiver");
        }
    }

    async fn handle_command(self: &Arc<Self>, command: Command<T>) {
        match command {
            Command::Machine(event) => self.step(event).await,
            Command::Established {
                generation,
                connection,
            } => {
                let current = generation == self.current_generation()
                    && lock(&self.machine).state() == ConnectionState::Connecting;
                if !current {
                    debug!(generation, "discarding stale connection");
                    tokio::spawn(async move { connection.shutdown().await });
                    return;
                }
                *lock(&self.connection) = Some(connection);
                self.step(Event::TransportConnected).await;
            }
            Command::EstablishFailed { generation, error } => {
                if generation != self.current_generation() {
                    return;
                }
                warn!(generation, error = %error, "connection attempt failed");
                let event = match error {
                    ClientError::AuthRejected(reason) => Event::AuthRejected { reason },
                    other => Event::TransportFailed {
                        error: other.to_string(),
                    },
                };
                self.step(event).await;
            }
            Command::Drain => {
                if self.current_connection().is_some() {
                    tokio::spawn(Arc::clone(self).drain());
                }
            }
            Command::Resync(Some(conversation)) => {
                tokio::spawn(Arc::clone(self).resync(conversation));
            }
            Command::Resync(None) => {
                let conversations: Vec<_> = lock(&self.sync)
                    .cursors()
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect();
                for conversation in conversations {
                    tokio::spawn(Arc::clone(self).resync(conversation));
                }
            }
            Command::Shutdown => {}
        }
    }

    async fn handle_signal(self: &Arc<Self>, signal: Signal) {
        if signal.generation != self.current_generation() {
            debug!(generation = signal.generation, "ignoring signal from stale connection");
            return;
        }
        match signal.signal {
            ConnectionSignal::Closed { reason } => {
                self.step(Event::ConnectionLost { reason }).await;
            }
            ConnectionSignal::IdleTimeout => self.step(Event::HeartbeatTimeout).await,
            ConnectionSignal::Event(event) => self.handle_event(event).await,
        }
    }

    async fn handle_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::ConversationJoined(joined) => {
                let conversation = joined.conversation_id;
                let cursor = lock(&self.sync).conversation(conversation).cursor();
                self.step(Event::RoomJoined { conversation }).await;
                if joined.last_sequence > cursor {
                    tokio::spawn(Arc::clone(self).resync(conversation));
                }
                self.notify(ClientNotification::ConversationJoined(joined))
                    .await;
            }
            ServerEvent::NewMessage(new) => self.accept_stored(new.message).await,
            ServerEvent::Typing(typing) => self.notify(ClientNotification::Typing(typing)).await,
            ServerEvent::Presence(presence) => {
                self.notify(ClientNotification::Presence(presence)).await
            }
            ServerEvent::MessagesDelivered(notice) => {
                self.notify(ClientNotification::Delivered(notice)).await
            }
            ServerEvent::ServerShutdown(notice) => {
                info!(delay_ms = notice.reconnect_delay_ms, "server shutting down");
                self.step(Event::ServerShutdown {
                    reconnect_delay: Duration::from_millis(notice.reconnect_delay_ms),
                })
                .await;
            }
        }
    }

    async fn step(self: &Arc<Self>, event: Event) {
        let actions = lock(&self.machine).handle(event);
        for action in actions {
            self.execute(action).await;
        }
    }

    async fn execute(self: &Arc<Self>, action: Action) {
        match action {
            Action::OpenTransport => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                if !self.platform.is_network_available() {
                    let _ = self.command(Command::EstablishFailed {
                        generation,
                        error: ClientError::ConnectionFailed("network unavailable".into()),
                    });
                    return;
                }
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    let config = shared.config.connection_config();
                    let result = Connection::establish(
                        Arc::clone(&shared.transport),
                        &config,
                        generation,
                        shared.signals.clone(),
                    )
                    .await;
                    let command = match result {
                        Ok(connection) => Command::Established {
                            generation,
                            connection: Arc::new(connection),
                        },
                        Err(error) => Command::EstablishFailed { generation, error },
                    };
                    let _ = shared.command(command);
                });
            }
            Action::CloseTransport => {
                let connection = lock(&self.connection).take();
                if let Some(connection) = connection {
                    connection.shutdown().await;
                }
                // Invalidate anything still in flight from the closed connection.
                self.generation.fetch_add(1, Ordering::SeqCst);
                let requeued = lock(&self.outbox).requeue_in_flight();
                if requeued > 0 {
                    debug!(requeued, "outbox entries requeued");
                }
            }
            Action::StartReconnectTimer { delay } => {
                let commands = self.commands.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = commands.send(Command::Machine(Event::ReconnectTimer));
                });
                if let Some(previous) = lock(&self.reconnect_timer).replace(timer) {
                    previous.abort();
                }
            }
            Action::CancelReconnectTimer => {
                if let Some(timer) = lock(&self.reconnect_timer).take() {
                    timer.abort();
                }
            }
            Action::StartHeartbeat => {
                if let Some(connection) = self.current_connection() {
                    connection.start_heartbeat();
                }
            }
            Action::StopHeartbeat => {
                if let Some(connection) = self.current_connection() {
                    connection.stop_heartbeat();
                }
            }
            Action::JoinRoom { conversation } => {
                tokio::spawn(Arc::clone(self).rejoin(conversation));
            }
            Action::Resync => {
                let _ = self.command(Command::Resync(None));
            }
            Action::DrainOutbox => {
                let _ = self.command(Command::Drain);
            }
            Action::Emit(event) => {
                self.notify(ClientNotification::Lifecycle(event)).await;
            }
        }
    }

    async fn rejoin(self: Arc<Self>, conversation: ConversationId) {
        let Some(connection) = self.current_connection() else {
            return;
        };
        let request = ClientEvent::JoinConversation(ConversationRef {
            conversation_id: conversation,
        });
        match connection.emit_with_ack(&request).await {
            Ok(_) => debug!(%conversation, "room re-joined"),
            Err(e) => warn!(%conversation, error = %e, "failed to re-join room"),
        }
    }

    /// Send QUEUED outbox entries one at a time, in order.
    async fn drain(self: Arc<Self>) {
        let _guard = self.drain_lock.lock().await;
        loop {
            let Some(connection) = self.current_connection() else {
                break;
            };
            let Some(entry) = lock(&self.outbox).next_ready() else {
                break;
            };

            let request = ClientEvent::SendMessage(SendMessage {
                conversation_id: entry.conversation_id,
                local_id: entry.local_id,
                body: entry.body.clone(),
            });
            let result = match connection.emit_with_ack(&request).await {
                Ok(value) => decode_reply::<SendReply>(value),
                Err(e) => Err(e),
            };

            match result {
                Ok(reply) => {
                    if reply.duplicate {
                        debug!(local_id = %entry.local_id, "server already had this message");
                    }
                    self.accept_stored(reply.message).await;
                }
                Err(ClientError::Ack(AckError::ConnectionClosed)) | Err(ClientError::NotConnected) => {
                    lock(&self.outbox).requeue(&entry.local_id);
                    break;
                }
                Err(e) => {
                    warn!(local_id = %entry.local_id, error = %e, "send attempt failed");
                    let failed = {
                        let mut outbox = lock(&self.outbox);
                        match outbox.mark_attempt_failed(&entry.local_id) {
                            Some(DeliveryStatus::Failed) => outbox.get(&entry.local_id).cloned(),
                            _ => None,
                        }
                    };
                    if let Some(failed) = failed {
                        self.notify(ClientNotification::Failed(failed)).await;
                    }
                }
            }
        }
    }

    /// Page through everything after the cursor of `conversation`.
    async fn resync(self: Arc<Self>, conversation: ConversationId) {
        loop {
            let Some(connection) = self.current_connection() else {
                return;
            };
            let after = lock(&self.sync).conversation(conversation).cursor();
            let request = ClientEvent::Sync(SyncRequest {
                conversation_id: conversation,
                after_sequence: after,
                limit: self.config.sync_page_size,
            });
            let reply = match connection.emit_with_ack(&request).await {
                Ok(value) => decode_reply::<SyncReply>(value),
                Err(e) => Err(e),
            };
            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(%conversation, error = %e, "resync failed");
                    return;
                }
            };

            debug!(
                %conversation,
                %after,
                count = reply.messages.len(),
                has_more = reply.has_more,
                "resync page"
            );
            let sent = self.match_outbox(&reply.messages);
            for (local_id, message) in sent {
                self.notify(ClientNotification::Sent { local_id, message })
                    .await;
            }
            let mut applied = lock(&self.sync)
                .conversation(conversation)
                .apply_batch(reply.messages);
            let progressed = !applied.delivered.is_empty();
            // Paging continues below; held messages wait for the next page.
            applied.needs_resync = false;
            self.publish(conversation, applied).await;

            if !reply.has_more || !progressed {
                return;
            }
        }
    }

    /// Handle a message the server stored (ack reply or live push).
    async fn accept_stored(self: &Arc<Self>, message: ChatMessage) {
        for (local_id, message) in self.match_outbox(std::slice::from_ref(&message)) {
            self.notify(ClientNotification::Sent { local_id, message })
                .await;
        }
        let conversation = message.conversation_id;
        let applied = lock(&self.sync).apply(message);
        self.publish(conversation, applied).await;
    }

    fn match_outbox(&self, messages: &[ChatMessage]) -> Vec<(LocalId, ChatMessage)> {
        let mut outbox = lock(&self.outbox);
        messages
            .iter()
            .filter_map(|m| outbox.mark_sent(m).map(|entry| (entry.local_id, m.clone())))
            .collect()
    }

    /// Hand applied messages to the application and acknowledge delivery.
    async fn publish(self: &Arc<Self>, conversation: ConversationId, applied: Applied) {
        let me = self.config.auth.device_id.clone();
        for message in &applied.delivered {
            let own = me.as_ref().is_some_and(|d| message.sender.is_device(d));
            if !own {
                self.platform.show_notification(message);
            }
            self.notify(ClientNotification::Message(message.clone()))
                .await;
        }

        if let (Some(me), Some(connection)) = (me, self.current_connection()) {
            let server_ids = applied.receipts_for(&me);
            if !server_ids.is_empty() {
                let receipt = ClientEvent::MessagesDelivered(DeliveryReceipt {
                    conversation_id: conversation,
                    server_ids,
                });
                if let Err(e) = connection.emit(&receipt).await {
                    debug!(error = %e, "delivery receipt not sent");
                }
            }
        }

        if applied.needs_resync {
            let _ = self.command(Command::Resync(Some(conversation)));
        }
    }
}
