//! Main ChatRelay server coordination.
//!
//! ChatRelay owns the collaborators (message store, KV store, push and auth)
//! together with the presence registry and the broadcast router, and
//! implements every operation a connected peer can request.

use crate::auth::{Authenticator, ConfigAuthenticator, Identity};
use crate::config::Config;
use crate::error::Result;
use crate::kv::KeyValueStore;
use crate::limits::RateLimits;
use crate::presence::{PresenceChange, PresenceRegistry};
use crate::push::{LogPushDispatcher, PushDispatcher};
use crate::router::{Room, Router};
use crate::storage::{Conversation, MessageStore, StoreMessageRequest};
use parley_types::{
    AckReply, AdminEvent, AdminSendMessage, AgentId, AppId, ClientEvent, ConnectionId, ConversationId,
    ConversationJoined, DeliveryNotice, DeliveryReceipt, DeviceId, Empty, ErrorKind, JoinReply,
    Namespace, NewMessage, PresenceNotice, RemoteError, SendMessage, SendReply, Sender,
    ServerEvent, SessionInfo, SessionsReply, ShutdownNotice, SyncReply, SyncRequest, TypingNotice,
    TypingUpdate,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Operational metrics for monitoring relay activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Total WebSocket connections accepted.
    pub connections_total: AtomicU64,
    /// Connections refused by the per-address limiter or during shutdown.
    pub connections_rejected: AtomicU64,
    /// CONNECT attempts refused by the authenticator.
    pub auth_failures: AtomicU64,
    /// Typed events handled.
    pub events_total: AtomicU64,
    /// Messages newly stored.
    pub messages_stored: AtomicU64,
    /// Sends resolved to an already stored message.
    pub duplicate_messages: AtomicU64,
    /// Total rate limit rejections (connection + event + global).
    pub rate_limit_hits: AtomicU64,
    /// Frames or packets that could not be decoded.
    pub malformed_frames: AtomicU64,
    /// Offline push notifications requested.
    pub push_notifications: AtomicU64,
    /// Events answered with an error.
    pub errors_total: AtomicU64,
}

/// An authenticated connection.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Connection id (also the Engine.IO session id).
    pub connection_id: ConnectionId,
    /// Who is connected.
    pub identity: Identity,
    /// Unix millis of authentication.
    pub connected_at: i64,
}

impl Peer {
    /// Presence record for end-user connections.
    pub fn session_info(&self) -> Option<SessionInfo> {
        match &self.identity {
            Identity::User { app_id, device_id } => Some(SessionInfo {
                connection_id: self.connection_id,
                device_id: device_id.clone(),
                app_id: app_id.clone(),
                connected_at: self.connected_at,
            }),
            Identity::Agent { .. } => None,
        }
    }
}

type Reply<T> = std::result::Result<T, RemoteError>;

fn reply<T: Serialize>(result: Reply<T>) -> AckReply {
    match result {
        Ok(data) => AckReply::success(&data),
        Err(error) => AckReply::failure(error),
    }
}

fn not_found(id: &ConversationId) -> RemoteError {
    RemoteError::new(ErrorKind::ConversationNotFound, id.to_string())
}

/// Main relay server.
pub struct ChatRelay {
    config: Config,
    store: Arc<dyn MessageStore>,
    kv: Arc<dyn KeyValueStore>,
    presence: PresenceRegistry,
    router: Router,
    auth: Arc<dyn Authenticator>,
    push: Arc<dyn PushDispatcher>,
    rate_limits: RateLimits,
    metrics: RelayMetrics,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for ChatRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRelay")
            .field("config", &self.config)
            .field("presence", &self.presence)
            .field("router", &self.router)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl ChatRelay {
    /// Create a new ChatRelay with the given config and collaborators.
    ///
    /// Authentication uses the `[auth]` config section and offline pushes are
    /// logged until replaced with the `with_*` builders.
    pub fn new(config: Config, store: Arc<dyn MessageStore>, kv: Arc<dyn KeyValueStore>) -> Self {
        let rate_limits = RateLimits::new(&config.limits);
        let presence = PresenceRegistry::new(kv.clone(), config.presence.ttl());
        let router = Router::new(kv.clone());
        let auth = Arc::new(ConfigAuthenticator::new(config.auth.clone()));
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            store,
            kv,
            presence,
            router,
            auth,
            push: Arc::new(LogPushDispatcher),
            rate_limits,
            metrics: RelayMetrics::default(),
            shutdown,
        }
    }

    /// Replace the authenticator.
    pub fn with_authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = auth;
        self
    }

    /// Replace the offline push dispatcher.
    pub fn with_push_dispatcher(mut self, push: Arc<dyn PushDispatcher>) -> Self {
        self.push = push;
        self
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get access to the message store.
    pub fn store(&self) -> &dyn MessageStore {
        self.store.as_ref()
    }

    /// Get a clone of the KV store Arc for background tasks.
    pub fn kv(&self) -> Arc<dyn KeyValueStore> {
        self.kv.clone()
    }

    /// Get access to the presence registry.
    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// Get access to the broadcast router.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Get access to the authenticator.
    pub fn authenticator(&self) -> &dyn Authenticator {
        self.auth.as_ref()
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Make an authenticated peer reachable and announce it.
    ///
    /// End users go online and are placed in their most recently updated
    /// conversation; operators join their app room.
    pub async fn attach(&self, peer: &Peer, outbound: mpsc::Sender<String>) -> Result<()> {
        let namespace = peer.identity.namespace();
        self.router.register(peer.connection_id, namespace, outbound);

        match &peer.identity {
            Identity::User { app_id, device_id } => {
                if let Some(session) = peer.session_info() {
                    if self.presence.set_presence(&session).await? == PresenceChange::Online {
                        self.announce_presence(app_id, device_id, true).await;
                    }
                }
                if let Some(conversation) = self.store.latest_conversation(app_id, device_id).await? {
                    self.place_in(&peer.connection_id, &conversation).await?;
                }
            }
            Identity::Agent { app_id, .. } => {
                self.router
                    .join(&peer.connection_id, &Room::App(app_id.clone()))
                    .await?;
            }
        }
        tracing::info!(
            connection = %peer.connection_id,
            app = %peer.identity.app_id(),
            namespace = namespace.path(),
            "peer attached"
        );
        Ok(())
    }

    /// Forget a peer and announce the device offline when it was the last
    /// connection.
    pub async fn detach(&self, peer: &Peer) -> Result<()> {
        // Presence is released even when room cleanup fails.
        let unregistered = self.router.unregister(&peer.connection_id).await;
        if let Identity::User { app_id, device_id } = &peer.identity {
            let change = self
                .presence
                .remove_presence(app_id, device_id, &peer.connection_id)
                .await?;
            if change == PresenceChange::Offline {
                self.announce_presence(app_id, device_id, false).await;
            }
        }
        unregistered?;
        tracing::info!(connection = %peer.connection_id, "peer detached");
        Ok(())
    }

    /// Heartbeat from a peer: re-arm its presence TTLs.
    pub async fn heartbeat(&self, peer: &Peer) -> Result<()> {
        if let Some(session) = peer.session_info() {
            if self.presence.refresh_presence(&session).await? == PresenceChange::Online {
                self.announce_presence(&session.app_id, &session.device_id, true)
                    .await;
            }
        }
        Ok(())
    }

    async fn announce_presence(&self, app: &AppId, device: &DeviceId, online: bool) {
        let event = ServerEvent::Presence(PresenceNotice {
            device_id: device.clone(),
            online,
        });
        self.router
            .publish(Namespace::Admin, &Room::App(app.clone()), &event, None)
            .await;
    }

    async fn place_in(&self, connection: &ConnectionId, conversation: &Conversation) -> Result<()> {
        self.router
            .join_exclusive(connection, &Room::Conversation(conversation.id))
            .await?;
        self.router.emit_to(
            connection,
            &ServerEvent::ConversationJoined(ConversationJoined {
                conversation_id: conversation.id,
                last_sequence: conversation.last_sequence,
            }),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event dispatch
    // ------------------------------------------------------------------

    /// Handle an event from an end-user connection.
    pub async fn handle_client_event(&self, peer: &Peer, event: ClientEvent) -> AckReply {
        let Identity::User { app_id, device_id } = &peer.identity else {
            return AckReply::failure(RemoteError::new(
                ErrorKind::InvalidRequest,
                "client events require a device connection",
            ));
        };
        self.metrics.events_total.fetch_add(1, Ordering::Relaxed);

        let result = match event {
            ClientEvent::JoinConversation(r) => {
                reply(self.join_user(peer, app_id, device_id, r.conversation_id).await)
            }
            ClientEvent::LeaveConversation(r) => reply(self.leave(peer, r.conversation_id).await),
            ClientEvent::SendMessage(req) => {
                reply(self.send_user_message(peer, app_id, device_id, req).await)
            }
            ClientEvent::Typing(update) => {
                reply(self.user_typing(peer, app_id, device_id, update).await)
            }
            ClientEvent::Sync(req) => reply(self.sync(app_id, device_id, req).await),
            ClientEvent::MessagesDelivered(receipt) => {
                reply(self.messages_delivered(app_id, device_id, receipt).await)
            }
        };
        self.count_failure(&result);
        result
    }

    /// Handle an event from an operator connection.
    pub async fn handle_admin_event(&self, peer: &Peer, event: AdminEvent) -> AckReply {
        let Identity::Agent {
            app_id,
            agent_id,
            name,
        } = &peer.identity
        else {
            return AckReply::failure(RemoteError::new(
                ErrorKind::InvalidRequest,
                "admin events require an operator connection",
            ));
        };
        self.metrics.events_total.fetch_add(1, Ordering::Relaxed);

        let result = match event {
            AdminEvent::JoinConversation(r) => {
                reply(self.join_agent(peer, app_id, r.conversation_id).await)
            }
            AdminEvent::LeaveConversation(r) => reply(self.leave(peer, r.conversation_id).await),
            AdminEvent::SendMessage(req) => {
                reply(self.send_agent_message(app_id, agent_id, name, req).await)
            }
            AdminEvent::Typing(update) => {
                reply(self.agent_typing(app_id, agent_id, name, update).await)
            }
            AdminEvent::ListSessions(Empty {}) => reply(self.list_sessions(app_id).await),
        };
        self.count_failure(&result);
        result
    }

    fn count_failure(&self, reply: &AckReply) {
        if !reply.ok {
            self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Conversation lookup restricted to the device that owns it.
    async fn owned_conversation(
        &self,
        app: &AppId,
        device: &DeviceId,
        id: &ConversationId,
    ) -> Reply<Conversation> {
        match self.store.get_conversation(id).await? {
            Some(c) if c.app_id == *app && c.device_id == *device => Ok(c),
            _ => Err(not_found(id)),
        }
    }

    /// Conversation lookup restricted to an app.
    async fn app_conversation(&self, app: &AppId, id: &ConversationId) -> Reply<Conversation> {
        match self.store.get_conversation(id).await? {
            Some(c) if c.app_id == *app => Ok(c),
            _ => Err(not_found(id)),
        }
    }

    async fn join_user(
        &self,
        peer: &Peer,
        app: &AppId,
        device: &DeviceId,
        id: ConversationId,
    ) -> Reply<JoinReply> {
        let conversation = self.owned_conversation(app, device, &id).await?;
        self.router
            .join_exclusive(&peer.connection_id, &Room::Conversation(id))
            .await?;
        Ok(JoinReply {
            conversation_id: id,
            last_sequence: conversation.last_sequence,
        })
    }

    async fn join_agent(&self, peer: &Peer, app: &AppId, id: ConversationId) -> Reply<JoinReply> {
        let conversation = self.app_conversation(app, &id).await?;
        self.router
            .join(&peer.connection_id, &Room::Conversation(id))
            .await?;
        Ok(JoinReply {
            conversation_id: id,
            last_sequence: conversation.last_sequence,
        })
    }

    async fn leave(&self, peer: &Peer, id: ConversationId) -> Reply<Empty> {
        self.router
            .leave(&peer.connection_id, &Room::Conversation(id))
            .await?;
        Ok(Empty {})
    }

    /// Store an end-user message and fan it out.
    ///
    /// Without a conversation id the message goes to the device's latest
    /// conversation, which is created (and joined) on first use.
    pub async fn send_user_message(
        &self,
        peer: &Peer,
        app: &AppId,
        device: &DeviceId,
        req: SendMessage,
    ) -> Reply<SendReply> {
        if req.body.trim().is_empty() {
            return Err(RemoteError::new(ErrorKind::InvalidRequest, "empty message body"));
        }
        let conversation = match req.conversation_id {
            Some(id) => self.owned_conversation(app, device, &id).await?,
            None => match self.store.latest_conversation(app, device).await? {
                Some(c) => c,
                None => {
                    let created = self.store.create_conversation(app, device).await?;
                    tracing::info!(conversation = %created.id, device = %device, "conversation created");
                    self.place_in(&peer.connection_id, &created)
                        .await
                        .map_err(|e| RemoteError::new(ErrorKind::Internal, e.to_string()))?;
                    created
                }
            },
        };

        let outcome = self
            .store
            .store_message(StoreMessageRequest {
                local_id: req.local_id,
                conversation_id: conversation.id,
                sender: Sender::User {
                    device_id: device.clone(),
                },
                body: req.body,
            })
            .await?;

        if outcome.duplicate {
            self.metrics.duplicate_messages.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.messages_stored.fetch_add(1, Ordering::Relaxed);
            let event = ServerEvent::NewMessage(NewMessage {
                message: outcome.message.clone(),
            });
            self.router
                .broadcast_conversation(&conversation.id, &event, None)
                .await;
        }
        Ok(SendReply {
            message: outcome.message,
            duplicate: outcome.duplicate,
        })
    }

    /// Store an operator reply, deliver it to the end user's namespace and
    /// request a push when the device has no live connection.
    pub async fn send_agent_message(
        &self,
        app: &AppId,
        agent_id: &AgentId,
        name: &str,
        req: AdminSendMessage,
    ) -> Reply<SendReply> {
        if req.body.trim().is_empty() {
            return Err(RemoteError::new(ErrorKind::InvalidRequest, "empty message body"));
        }
        let conversation = self.app_conversation(app, &req.conversation_id).await?;

        let outcome = self
            .store
            .store_message(StoreMessageRequest {
                local_id: req.local_id,
                conversation_id: conversation.id,
                sender: Sender::Agent {
                    agent_id: agent_id.clone(),
                    name: name.to_string(),
                },
                body: req.body,
            })
            .await?;

        if outcome.duplicate {
            self.metrics.duplicate_messages.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.messages_stored.fetch_add(1, Ordering::Relaxed);
            let event = ServerEvent::NewMessage(NewMessage {
                message: outcome.message.clone(),
            });
            self.router
                .publish(
                    Namespace::Client,
                    &Room::Conversation(conversation.id),
                    &event,
                    None,
                )
                .await;

            // Unknown presence counts as offline: a spare push beats a lost one.
            let online = match self.presence.is_online(app, &conversation.device_id).await {
                Ok(online) => online,
                Err(e) => {
                    tracing::warn!(device = %conversation.device_id, error = %e, "presence lookup failed");
                    false
                }
            };
            if !online {
                self.metrics.push_notifications.fetch_add(1, Ordering::Relaxed);
                self.push
                    .notify_offline(app, &conversation.device_id, &outcome.message)
                    .await;
            }
        }
        Ok(SendReply {
            message: outcome.message,
            duplicate: outcome.duplicate,
        })
    }

    async fn user_typing(
        &self,
        peer: &Peer,
        app: &AppId,
        device: &DeviceId,
        update: TypingUpdate,
    ) -> Reply<Empty> {
        self.owned_conversation(app, device, &update.conversation_id)
            .await?;
        let event = ServerEvent::Typing(TypingNotice {
            conversation_id: update.conversation_id,
            sender: Sender::User {
                device_id: device.clone(),
            },
            is_typing: update.is_typing,
        });
        self.router
            .publish(
                Namespace::Client,
                &Room::Conversation(update.conversation_id),
                &event,
                Some(&peer.connection_id),
            )
            .await;
        self.router
            .publish(Namespace::Admin, &Room::App(app.clone()), &event, None)
            .await;
        Ok(Empty {})
    }

    async fn agent_typing(
        &self,
        app: &AppId,
        agent_id: &AgentId,
        name: &str,
        update: TypingUpdate,
    ) -> Reply<Empty> {
        self.app_conversation(app, &update.conversation_id).await?;
        let event = ServerEvent::Typing(TypingNotice {
            conversation_id: update.conversation_id,
            sender: Sender::Agent {
                agent_id: agent_id.clone(),
                name: name.to_string(),
            },
            is_typing: update.is_typing,
        });
        self.router
            .publish(
                Namespace::Client,
                &Room::Conversation(update.conversation_id),
                &event,
                None,
            )
            .await;
        Ok(Empty {})
    }

    /// Messages after a cursor, one page at a time.
    pub async fn sync(&self, app: &AppId, device: &DeviceId, req: SyncRequest) -> Reply<SyncReply> {
        self.owned_conversation(app, device, &req.conversation_id)
            .await?;
        let storage = &self.config.storage;
        let page = match req.limit {
            0 => storage.default_page_size,
            n => n.min(storage.max_page_size),
        }
        .max(1);

        let mut messages = self
            .store
            .messages_after(&req.conversation_id, req.after_sequence, page + 1)
            .await?;
        let has_more = messages.len() > page as usize;
        messages.truncate(page as usize);
        Ok(SyncReply { messages, has_more })
    }

    async fn messages_delivered(
        &self,
        app: &AppId,
        device: &DeviceId,
        receipt: DeliveryReceipt,
    ) -> Reply<Empty> {
        self.owned_conversation(app, device, &receipt.conversation_id)
            .await?;
        let marked = self
            .store
            .mark_delivered(&receipt.server_ids, device)
            .await?;
        if marked > 0 {
            let event = ServerEvent::MessagesDelivered(DeliveryNotice {
                conversation_id: receipt.conversation_id,
                device_id: device.clone(),
                server_ids: receipt.server_ids,
            });
            self.router
                .publish(
                    Namespace::Admin,
                    &Room::Conversation(receipt.conversation_id),
                    &event,
                    None,
                )
                .await;
        }
        Ok(Empty {})
    }

    /// Live end-user sessions of an app.
    pub async fn list_sessions(&self, app: &AppId) -> Reply<SessionsReply> {
        let sessions = self.presence.list_sessions(app).await?;
        Ok(SessionsReply { sessions })
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Subscribe to the shutdown signal.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Tell every connection to reconnect later, with staggered delays so
    /// clients do not return all at once, then close the sessions.
    ///
    /// Returns the number of connections notified.
    pub fn shutdown_all(&self) -> usize {
        let stagger = self.config.server.shutdown_stagger_ms.max(1);
        let connections = self.router.connection_ids();
        for (i, connection) in connections.iter().enumerate() {
            let event = ServerEvent::ServerShutdown(ShutdownNotice {
                reconnect_delay_ms: stagger * (i as u64 + 1),
            });
            self.router.emit_to(connection, &event);
        }
        self.shutdown.send_replace(true);
        tracing::info!(connections = connections.len(), "shutdown announced");
        connections.len()
    }
}
