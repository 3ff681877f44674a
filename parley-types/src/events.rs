//! Typed events carried by EVENT packets.
//!
//! Each direction/namespace has a closed event set. Packets are decoded into
//! these enums once at the connection boundary; an unknown event name is a
//! [`CodecError::UnknownEvent`] and the frame is dropped.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    ChatMessage, CodecError, ConversationId, DeviceId, LocalId, Namespace, Packet, RemoteError,
    Sender, Sequence, ServerId, SessionInfo,
};

/// A closed set of named events with one JSON argument each.
///
/// Variants serialize adjacently tagged as `{"event": name, "data": payload}`,
/// which maps onto the wire array `[name, payload]`.
pub trait EventSet: Serialize + DeserializeOwned + Sized {
    /// Every event name in the set.
    const NAMES: &'static [&'static str];

    /// Decode an EVENT packet into the set.
    fn from_packet(packet: &Packet) -> Result<Self, CodecError> {
        let name = packet
            .event_name()
            .ok_or_else(|| CodecError::InvalidPayload("not an EVENT packet".into()))?;
        if !Self::NAMES.contains(&name) {
            return Err(CodecError::UnknownEvent(name.to_string()));
        }
        let data = packet
            .args()
            .first()
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        serde_json::from_value(serde_json::json!({ "event": name, "data": data }))
            .map_err(|e| CodecError::InvalidPayload(format!("{name}: {e}")))
    }

    /// Encode as an EVENT packet on `namespace`.
    fn to_packet(&self, namespace: Namespace, ack_id: Option<u64>) -> Result<Packet, CodecError> {
        let value =
            serde_json::to_value(self).map_err(|e| CodecError::InvalidPayload(e.to_string()))?;
        let name = value
            .get("event")
            .and_then(Value::as_str)
            .ok_or_else(|| CodecError::InvalidPayload("event tag missing".into()))?
            .to_string();
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        Ok(Packet::event(namespace, &name, vec![data], ack_id))
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Reference to a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    /// Conversation id.
    pub conversation_id: ConversationId,
}

/// End-user message send. Without a conversation id a new conversation starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    /// Target conversation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    /// Idempotency key.
    pub local_id: LocalId,
    /// Message text.
    pub body: String,
}

/// Operator message send into an existing conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminSendMessage {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Idempotency key.
    pub local_id: LocalId,
    /// Message text.
    pub body: String,
}

/// Typing indicator change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUpdate {
    /// Conversation being typed in.
    pub conversation_id: ConversationId,
    /// Started (`true`) or stopped (`false`).
    pub is_typing: bool,
}

/// Request for messages after a cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Conversation to resync.
    pub conversation_id: ConversationId,
    /// Return messages with sequence strictly greater than this.
    pub after_sequence: Sequence,
    /// Page size (0 = server default).
    #[serde(default)]
    pub limit: u32,
}

/// Client receipt for messages it has displayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    /// Conversation the messages belong to.
    pub conversation_id: ConversationId,
    /// Delivered messages.
    pub server_ids: Vec<ServerId>,
}

/// Empty argument object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// Server notice that a connection now sits in a conversation room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationJoined {
    /// Conversation joined.
    pub conversation_id: ConversationId,
    /// Highest sequence stored for the conversation.
    pub last_sequence: Sequence,
}

/// A message was stored in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    /// The stored message.
    pub message: ChatMessage,
}

/// Typing indicator fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    /// Conversation being typed in.
    pub conversation_id: ConversationId,
    /// Who is typing.
    pub sender: Sender,
    /// Started or stopped.
    pub is_typing: bool,
}

/// Device presence boundary transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceNotice {
    /// Device whose live-connection count crossed zero.
    pub device_id: DeviceId,
    /// `true` on 0→1, `false` on 1→0.
    pub online: bool,
}

/// Delivery receipt fan-out to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryNotice {
    /// Conversation the messages belong to.
    pub conversation_id: ConversationId,
    /// Device that received them.
    pub device_id: DeviceId,
    /// Delivered messages.
    pub server_ids: Vec<ServerId>,
}

/// Cooperative shutdown: reconnect after exactly this delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownNotice {
    /// Delay before the client should reconnect.
    pub reconnect_delay_ms: u64,
}

// ---------------------------------------------------------------------------
// Event sets
// ---------------------------------------------------------------------------

/// Events an end-user client sends on `/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Switch to a conversation room (ack).
    JoinConversation(ConversationRef),
    /// Leave a conversation room (ack).
    LeaveConversation(ConversationRef),
    /// Send a message (ack).
    SendMessage(SendMessage),
    /// Typing indicator.
    Typing(TypingUpdate),
    /// Fetch messages after a cursor (ack).
    Sync(SyncRequest),
    /// Delivery receipt.
    MessagesDelivered(DeliveryReceipt),
}

impl EventSet for ClientEvent {
    const NAMES: &'static [&'static str] = &[
        "join_conversation",
        "leave_conversation",
        "send_message",
        "typing",
        "sync",
        "messages_delivered",
    ];
}

/// Events an operator sends on `/admin`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum AdminEvent {
    /// Watch a conversation room (ack).
    JoinConversation(ConversationRef),
    /// Stop watching a conversation room (ack).
    LeaveConversation(ConversationRef),
    /// Reply in a conversation (ack).
    SendMessage(AdminSendMessage),
    /// Typing indicator.
    Typing(TypingUpdate),
    /// List live end-user sessions for the operator's app (ack).
    ListSessions(Empty),
}

impl EventSet for AdminEvent {
    const NAMES: &'static [&'static str] = &[
        "join_conversation",
        "leave_conversation",
        "send_message",
        "typing",
        "list_sessions",
    ];
}

/// Events the server pushes to either namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Connection placed in a conversation room.
    ConversationJoined(ConversationJoined),
    /// New stored message.
    NewMessage(NewMessage),
    /// Typing indicator.
    Typing(TypingNotice),
    /// Device online/offline.
    Presence(PresenceNotice),
    /// Delivery receipts.
    MessagesDelivered(DeliveryNotice),
    /// Cooperative shutdown.
    ServerShutdown(ShutdownNotice),
}

impl EventSet for ServerEvent {
    const NAMES: &'static [&'static str] = &[
        "conversation_joined",
        "new_message",
        "typing",
        "presence",
        "messages_delivered",
        "server_shutdown",
    ];
}

impl ServerEvent {
    /// Low-value events that may be dropped under backpressure.
    pub fn is_droppable(&self) -> bool {
        matches!(self, ServerEvent::Typing(_) | ServerEvent::Presence(_))
    }
}

// ---------------------------------------------------------------------------
// Ack replies
// ---------------------------------------------------------------------------

/// Envelope of every ACK reply: `{"ok": true, "data": ...}` or
/// `{"ok": false, "error": {"kind": ..., "message": ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckReply {
    /// Success flag.
    pub ok: bool,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl AckReply {
    /// Successful reply carrying `data`.
    pub fn success<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                ok: true,
                data: Some(value),
                error: None,
            },
            Err(e) => Self::failure(RemoteError::new(crate::ErrorKind::Internal, e.to_string())),
        }
    }

    /// Failed reply.
    pub fn failure(error: RemoteError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
        }
    }

    /// Parse the first argument of an ACK packet.
    pub fn from_args(args: &[Value]) -> Result<Self, CodecError> {
        let first = args
            .first()
            .ok_or_else(|| CodecError::InvalidPayload("empty ACK".into()))?;
        serde_json::from_value(first.clone()).map_err(|e| CodecError::InvalidPayload(e.to_string()))
    }

    /// Convert into the success payload or the remote error.
    pub fn into_result(self) -> Result<Value, RemoteError> {
        match (self.ok, self.error) {
            (true, _) => Ok(self.data.unwrap_or(Value::Null)),
            (false, Some(error)) => Err(error),
            (false, None) => Err(RemoteError::new(
                crate::ErrorKind::Internal,
                "negative ack without error",
            )),
        }
    }

    /// Encode as the argument list of an ACK packet.
    pub fn to_args(&self) -> Vec<Value> {
        vec![serde_json::to_value(self).unwrap_or(Value::Null)]
    }
}

/// Reply to `join_conversation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinReply {
    /// Conversation joined.
    pub conversation_id: ConversationId,
    /// Highest stored sequence.
    pub last_sequence: Sequence,
}

/// Reply to `send_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReply {
    /// The stored message (the original one on a duplicate send).
    pub message: ChatMessage,
    /// Whether `localId` had already been stored.
    pub duplicate: bool,
}

/// Reply to `sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReply {
    /// Messages in ascending sequence order.
    pub messages: Vec<ChatMessage>,
    /// More messages exist after the last one returned.
    pub has_more: bool,
}

/// Reply to `list_sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionsReply {
    /// Live end-user sessions.
    pub sessions: Vec<SessionInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use serde_json::json;

    #[test]
    fn client_event_from_packet() {
        let conversation = ConversationId::new();
        let raw = format!(
            r#"25["join_conversation",{{"conversationId":"{conversation}"}}]"#
        );
        let packet = Packet::decode(&raw).unwrap();
        let event = ClientEvent::from_packet(&packet).unwrap();
        assert_eq!(
            event,
            ClientEvent::JoinConversation(ConversationRef {
                conversation_id: conversation
            })
        );
        assert_eq!(packet.ack_id, Some(5));
    }

    #[test]
    fn unknown_event_is_rejected() {
        let packet = Packet::decode(r#"2["self_destruct",{}]"#).unwrap();
        assert_eq!(
            ClientEvent::from_packet(&packet),
            Err(CodecError::UnknownEvent("self_destruct".into()))
        );
    }

    #[test]
    fn admin_only_event_is_unknown_on_client_set() {
        let packet = Packet::decode(r#"2["list_sessions",{}]"#).unwrap();
        assert!(matches!(
            ClientEvent::from_packet(&packet),
            Err(CodecError::UnknownEvent(_))
        ));
        assert!(AdminEvent::from_packet(&packet).is_ok());
    }

    #[test]
    fn list_sessions_without_argument() {
        let packet = Packet::decode(r#"2/admin,3["list_sessions"]"#).unwrap();
        assert_eq!(
            AdminEvent::from_packet(&packet).unwrap(),
            AdminEvent::ListSessions(Empty {})
        );
    }

    #[test]
    fn bad_payload_is_invalid_not_unknown() {
        let packet = Packet::decode(r#"2["typing",{"isTyping":"yes"}]"#).unwrap();
        assert!(matches!(
            ClientEvent::from_packet(&packet),
            Err(CodecError::InvalidPayload(_))
        ));
    }

    #[test]
    fn server_event_packet_shape() {
        let event = ServerEvent::ServerShutdown(ShutdownNotice {
            reconnect_delay_ms: 2500,
        });
        let packet = event.to_packet(Namespace::Client, None).unwrap();
        assert_eq!(
            packet.encode(),
            r#"2["server_shutdown",{"reconnectDelayMs":2500}]"#
        );
        assert_eq!(ServerEvent::from_packet(&packet).unwrap(), event);
    }

    #[test]
    fn every_variant_name_is_listed() {
        let conversation = ConversationId::new();
        let events = vec![
            ClientEvent::JoinConversation(ConversationRef {
                conversation_id: conversation,
            }),
            ClientEvent::LeaveConversation(ConversationRef {
                conversation_id: conversation,
            }),
            ClientEvent::SendMessage(SendMessage {
                conversation_id: None,
                local_id: LocalId::new(),
                body: "hi".into(),
            }),
            ClientEvent::Typing(TypingUpdate {
                conversation_id: conversation,
                is_typing: true,
            }),
            ClientEvent::Sync(SyncRequest {
                conversation_id: conversation,
                after_sequence: Sequence::new(42),
                limit: 0,
            }),
            ClientEvent::MessagesDelivered(DeliveryReceipt {
                conversation_id: conversation,
                server_ids: vec![ServerId::new(1)],
            }),
        ];
        for event in events {
            let packet = event.to_packet(Namespace::Client, Some(1)).unwrap();
            let name = packet.event_name().unwrap().to_string();
            assert!(ClientEvent::NAMES.contains(&name.as_str()), "{name}");
            assert_eq!(ClientEvent::from_packet(&packet).unwrap(), event);
        }
    }

    #[test]
    fn droppable_events() {
        let typing = ServerEvent::Typing(TypingNotice {
            conversation_id: ConversationId::new(),
            sender: Sender::System,
            is_typing: true,
        });
        assert!(typing.is_droppable());
        let shutdown = ServerEvent::ServerShutdown(ShutdownNotice {
            reconnect_delay_ms: 0,
        });
        assert!(!shutdown.is_droppable());
    }

    #[test]
    fn ack_reply_success_and_failure() {
        let ok = AckReply::success(&json!({"x": 1}));
        let args = ok.to_args();
        assert_eq!(args, vec![json!({"ok": true, "data": {"x": 1}})]);
        assert_eq!(
            AckReply::from_args(&args).unwrap().into_result(),
            Ok(json!({"x": 1}))
        );

        let err = AckReply::failure(RemoteError::new(ErrorKind::RateLimited, "slow down"));
        let args = err.to_args();
        assert_eq!(
            args,
            vec![json!({"ok": false, "error": {"kind": "rate_limited", "message": "slow down"}})]
        );
        let result = AckReply::from_args(&args).unwrap().into_result();
        assert_eq!(result.unwrap_err().kind, ErrorKind::RateLimited);
    }

    #[test]
    fn empty_ack_is_invalid() {
        assert!(AckReply::from_args(&[]).is_err());
    }
}
