//! Namespace and room broadcast router.
//!
//! Rooms are `conversation:{id}` (both namespaces) and `app:{id}` (admin
//! only). Membership is kept in the KV store so it can be shared between
//! relay processes; the delivery handle of each local connection lives in
//! a concurrent map keyed by connection id.
//!
//! Every connection owns a bounded outbound queue. Broadcasting never waits
//! on a slow peer: when the queue is full the frame is dropped and counted,
//! and the client recovers through cursor resync.

use crate::error::KvResult;
use crate::kv::KeyValueStore;
use dashmap::DashMap;
use parley_types::{AppId, ConnectionId, ConversationId, EventSet, Frame, Namespace, ServerEvent};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, warn};

/// A broadcast target within a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    /// Everyone following one conversation.
    Conversation(ConversationId),
    /// Every operator of one app.
    App(AppId),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::Conversation(id) => write!(f, "conversation:{id}"),
            Room::App(id) => write!(f, "app:{id}"),
        }
    }
}

fn room_key(namespace: Namespace, room: &Room) -> String {
    format!("room:{}:{room}", namespace.path())
}

fn reverse_key(connection: &ConnectionId) -> String {
    format!("rooms:{connection}")
}

#[derive(Debug)]
struct ConnectionHandle {
    namespace: Namespace,
    tx: mpsc::Sender<String>,
}

/// Fans events out to rooms of connected sockets.
pub struct Router {
    kv: Arc<dyn KeyValueStore>,
    handles: DashMap<ConnectionId, ConnectionHandle>,
    dropped_frames: AtomicU64,
    failed_broadcasts: AtomicU64,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("connections", &self.handles.len())
            .field("dropped_frames", &self.dropped_frames.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Create a router over a shared KV store.
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            handles: DashMap::new(),
            dropped_frames: AtomicU64::new(0),
            failed_broadcasts: AtomicU64::new(0),
        }
    }

    /// Make a connection reachable for broadcasts.
    pub fn register(&self, connection: ConnectionId, namespace: Namespace, tx: mpsc::Sender<String>) {
        self.handles
            .insert(connection, ConnectionHandle { namespace, tx });
        debug!(connection = %connection, namespace = namespace.path(), "registered connection");
    }

    /// Remove a connection and every room membership it holds.
    pub async fn unregister(&self, connection: &ConnectionId) -> KvResult<()> {
        self.handles.remove(connection);

        let reverse = reverse_key(connection);
        let member = connection.to_string();
        for key in self.kv.members(&reverse).await? {
            self.kv.set_remove(&key, &member).await?;
        }
        self.kv.delete(&reverse).await?;
        debug!(connection = %connection, "unregistered connection");
        Ok(())
    }

    /// Add a connection to a room of its namespace.
    ///
    /// Returns `false` when the connection is not registered here.
    pub async fn join(&self, connection: &ConnectionId, room: &Room) -> KvResult<bool> {
        let Some(namespace) = self.namespace_of(connection) else {
            return Ok(false);
        };
        let key = room_key(namespace, room);
        self.kv.set_add(&key, &connection.to_string(), None).await?;
        self.kv.set_add(&reverse_key(connection), &key, None).await?;
        debug!(connection = %connection, room = %room, "joined room");
        Ok(true)
    }

    /// Remove a connection from a room. Returns whether it was a member.
    pub async fn leave(&self, connection: &ConnectionId, room: &Room) -> KvResult<bool> {
        let Some(namespace) = self.namespace_of(connection) else {
            return Ok(false);
        };
        let key = room_key(namespace, room);
        let change = self.kv.set_remove(&key, &connection.to_string()).await?;
        self.kv.set_remove(&reverse_key(connection), &key).await?;
        Ok(change.changed)
    }

    /// Leave every conversation room, then join `room`.
    ///
    /// End-user connections follow a single conversation at a time.
    pub async fn join_exclusive(&self, connection: &ConnectionId, room: &Room) -> KvResult<bool> {
        let Some(namespace) = self.namespace_of(connection) else {
            return Ok(false);
        };
        let target = room_key(namespace, room);
        let prefix = format!("room:{}:conversation:", namespace.path());
        let reverse = reverse_key(connection);
        let member = connection.to_string();

        for key in self.kv.members(&reverse).await? {
            if key.starts_with(&prefix) && key != target {
                self.kv.set_remove(&key, &member).await?;
                self.kv.set_remove(&reverse, &key).await?;
            }
        }
        self.join(connection, room).await
    }

    /// Room keys a connection currently belongs to.
    pub async fn rooms_of(&self, connection: &ConnectionId) -> KvResult<Vec<String>> {
        self.kv.members(&reverse_key(connection)).await
    }

    /// Send an event to every member of `room` in `namespace`.
    ///
    /// Returns how many connections accepted the frame.
    pub async fn broadcast(
        &self,
        namespace: Namespace,
        room: &Room,
        event: &ServerEvent,
        except: Option<&ConnectionId>,
    ) -> KvResult<usize> {
        let Some(frame) = encode(namespace, event) else {
            return Ok(0);
        };
        let members = self.kv.members(&room_key(namespace, room)).await?;

        let mut delivered = 0;
        for member in members {
            let Some(connection) = ConnectionId::parse(&member) else {
                continue;
            };
            if except == Some(&connection) {
                continue;
            }
            if self.deliver(&connection, frame.clone(), event) {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Like [`broadcast`](Self::broadcast), but a membership lookup failure
    /// is logged and counted instead of returned.
    ///
    /// Used after the triggering state change is already committed, where
    /// failing the caller would only make it retry work that succeeded.
    pub async fn publish(
        &self,
        namespace: Namespace,
        room: &Room,
        event: &ServerEvent,
        except: Option<&ConnectionId>,
    ) -> usize {
        match self.broadcast(namespace, room, event, except).await {
            Ok(delivered) => delivered,
            Err(e) => {
                self.failed_broadcasts.fetch_add(1, Ordering::Relaxed);
                warn!(namespace = namespace.path(), room = %room, error = %e, "broadcast failed");
                0
            }
        }
    }

    /// Send a conversation event to both namespaces independently: a
    /// failure on one side does not stop delivery on the other.
    pub async fn broadcast_conversation(
        &self,
        conversation: &ConversationId,
        event: &ServerEvent,
        except: Option<&ConnectionId>,
    ) -> usize {
        let room = Room::Conversation(*conversation);
        let users = self.publish(Namespace::Client, &room, event, except).await;
        let operators = self.publish(Namespace::Admin, &room, event, except).await;
        users + operators
    }

    /// Send an event to one connection.
    pub fn emit_to(&self, connection: &ConnectionId, event: &ServerEvent) -> bool {
        let Some(namespace) = self.namespace_of(connection) else {
            return false;
        };
        match encode(namespace, event) {
            Some(frame) => self.deliver(connection, frame, event),
            None => false,
        }
    }

    /// Connections registered in this process.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.handles.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.handles.len()
    }

    /// Frames dropped because a peer's queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Broadcasts abandoned because room membership could not be read.
    pub fn failed_broadcasts(&self) -> u64 {
        self.failed_broadcasts.load(Ordering::Relaxed)
    }

    fn namespace_of(&self, connection: &ConnectionId) -> Option<Namespace> {
        self.handles.get(connection).map(|h| h.namespace)
    }

    fn deliver(&self, connection: &ConnectionId, frame: String, event: &ServerEvent) -> bool {
        // Clone the sender so the map shard is not held while sending.
        let Some(tx) = self.handles.get(connection).map(|h| h.tx.clone()) else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                if event.is_droppable() {
                    debug!(connection = %connection, "outbound queue full, dropping low-value event");
                } else {
                    warn!(connection = %connection, "outbound queue full, dropping frame");
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

fn encode(namespace: Namespace, event: &ServerEvent) -> Option<String> {
    match event.to_packet(namespace, None) {
        Ok(packet) => Some(Frame::message(&packet).encode()),
        Err(e) => {
            error!(error = %e, "failed to encode server event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use parley_types::{Packet, PacketType, PresenceNotice, TypingNotice};

    fn router() -> Router {
        Router::new(Arc::new(MemoryStore::new()))
    }

    fn connect(router: &Router, namespace: Namespace, capacity: usize) -> (ConnectionId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = ConnectionId::new();
        router.register(id, namespace, tx);
        (id, rx)
    }

    fn typing(conversation: ConversationId) -> ServerEvent {
        ServerEvent::Typing(TypingNotice {
            conversation_id: conversation,
            sender: parley_types::Sender::User {
                device_id: "d1".into(),
            },
            is_typing: true,
        })
    }

    fn presence() -> ServerEvent {
        ServerEvent::Presence(PresenceNotice {
            device_id: "d1".into(),
            online: true,
        })
    }

    fn decode(raw: &str) -> Packet {
        Frame::decode(raw, usize::MAX)
            .unwrap()
            .packet()
            .unwrap()
            .unwrap()
    }

    #[test]
    fn room_names() {
        let id = ConversationId::new();
        assert_eq!(Room::Conversation(id).to_string(), format!("conversation:{id}"));
        assert_eq!(Room::App("acme".into()).to_string(), "app:acme");
    }

    #[tokio::test]
    async fn broadcast_excludes_sender() {
        let router = router();
        let conversation = ConversationId::new();
        let room = Room::Conversation(conversation);
        let (a, mut a_rx) = connect(&router, Namespace::Client, 8);
        let (b, mut b_rx) = connect(&router, Namespace::Client, 8);
        router.join(&a, &room).await.unwrap();
        router.join(&b, &room).await.unwrap();

        let delivered = router
            .broadcast(Namespace::Client, &room, &typing(conversation), Some(&a))
            .await
            .unwrap();

        assert_eq!(delivered, 1);
        assert!(a_rx.try_recv().is_err());
        let packet = decode(&b_rx.try_recv().unwrap());
        assert_eq!(packet.packet_type, PacketType::Event);
        assert_eq!(packet.event_name(), Some("typing"));
    }

    #[tokio::test]
    async fn conversation_events_reach_both_namespaces() {
        let router = router();
        let conversation = ConversationId::new();
        let room = Room::Conversation(conversation);
        let (user, mut user_rx) = connect(&router, Namespace::Client, 8);
        let (agent, mut agent_rx) = connect(&router, Namespace::Admin, 8);
        router.join(&user, &room).await.unwrap();
        router.join(&agent, &room).await.unwrap();

        let delivered = router
            .broadcast_conversation(&conversation, &typing(conversation), None)
            .await;

        assert_eq!(delivered, 2);
        let to_user = decode(&user_rx.try_recv().unwrap());
        let to_agent = decode(&agent_rx.try_recv().unwrap());
        assert_eq!(to_user.namespace, "/");
        assert_eq!(to_agent.namespace, "/admin");
        assert_eq!(to_user.data, to_agent.data);
    }

    #[tokio::test]
    async fn conversation_fan_out_survives_one_namespace_failing() {
        let router = Router::new(Arc::new(crate::kv::testing::PartitionedStore::new(
            "room:/:",
        )));
        let conversation = ConversationId::new();
        let room = Room::Conversation(conversation);
        let (agent, mut agent_rx) = connect(&router, Namespace::Admin, 8);
        router.join(&agent, &room).await.unwrap();

        let delivered = router
            .broadcast_conversation(&conversation, &typing(conversation), None)
            .await;

        assert_eq!(delivered, 1);
        assert_eq!(decode(&agent_rx.try_recv().unwrap()).namespace, "/admin");
        assert_eq!(router.failed_broadcasts(), 1);
    }

    #[tokio::test]
    async fn namespaces_do_not_share_rooms() {
        let router = router();
        let room = Room::App("acme".into());
        let (agent, mut agent_rx) = connect(&router, Namespace::Admin, 8);
        let (_user, mut user_rx) = connect(&router, Namespace::Client, 8);
        router.join(&agent, &room).await.unwrap();

        router
            .broadcast(Namespace::Client, &room, &presence(), None)
            .await
            .unwrap();
        assert!(agent_rx.try_recv().is_err());

        router
            .broadcast(Namespace::Admin, &room, &presence(), None)
            .await
            .unwrap();
        assert!(agent_rx.try_recv().is_ok());
        assert!(user_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_exclusive_leaves_previous_conversation() {
        let router = router();
        let first = ConversationId::new();
        let second = ConversationId::new();
        let (user, mut rx) = connect(&router, Namespace::Client, 8);

        router
            .join_exclusive(&user, &Room::Conversation(first))
            .await
            .unwrap();
        router
            .join_exclusive(&user, &Room::Conversation(second))
            .await
            .unwrap();

        let rooms = router.rooms_of(&user).await.unwrap();
        assert_eq!(rooms, vec![format!("room:/:conversation:{second}")]);

        router
            .broadcast(Namespace::Client, &Room::Conversation(first), &typing(first), None)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn admins_may_follow_many_conversations() {
        let router = router();
        let (agent, _rx) = connect(&router, Namespace::Admin, 8);
        let first = ConversationId::new();
        let second = ConversationId::new();

        router.join(&agent, &Room::Conversation(first)).await.unwrap();
        router.join(&agent, &Room::Conversation(second)).await.unwrap();

        assert_eq!(router.rooms_of(&agent).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unregister_clears_memberships() {
        let router = router();
        let conversation = ConversationId::new();
        let room = Room::Conversation(conversation);
        let (user, _rx) = connect(&router, Namespace::Client, 8);
        router.join(&user, &room).await.unwrap();

        router.unregister(&user).await.unwrap();

        assert_eq!(router.connection_count(), 0);
        assert!(router.rooms_of(&user).await.unwrap().is_empty());
        let delivered = router
            .broadcast(Namespace::Client, &room, &typing(conversation), None)
            .await
            .unwrap();
        assert_eq!(delivered, 0);
        assert!(!router.join(&user, &room).await.unwrap());
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let router = router();
        let room = Room::App("acme".into());
        let (agent, mut rx) = connect(&router, Namespace::Admin, 1);
        router.join(&agent, &room).await.unwrap();

        for _ in 0..3 {
            router
                .broadcast(Namespace::Admin, &room, &presence(), None)
                .await
                .unwrap();
        }

        assert_eq!(router.dropped_frames(), 2);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn emit_to_single_connection() {
        let router = router();
        let (user, mut rx) = connect(&router, Namespace::Client, 8);

        assert!(router.emit_to(&user, &presence()));
        assert!(!router.emit_to(&ConnectionId::new(), &presence()));
        assert_eq!(decode(&rx.try_recv().unwrap()).event_name(), Some("presence"));
    }
}
