//! JSON wire envelopes exchanged over a live connection.
//!
//! Every frame is `{"type": ..., "data": ...}`.  The `type` vocabulary is
//! fixed by the two enums below so an unknown or malformed payload fails at
//! deserialization instead of deep inside a handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ConnectionId, ConversationId, MessageId, MessageKind, MessagePriority, PresenceStatus,
    ReactionOp, UserId,
};

/// Frames a client may send to the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Send a message into a conversation.
    Message(SendMessage),

    /// Start or stop typing in a conversation.
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },

    /// Mark messages as read.
    ReadReceipt {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },

    /// Subscribe this connection to a conversation's live events.
    JoinConversation { conversation_id: ConversationId },

    /// Unsubscribe this connection from a conversation.
    LeaveConversation { conversation_id: ConversationId },

    /// Explicit presence change (e.g. `away`).
    Presence { status: PresenceStatus },

    /// Add or remove an emoji reaction.
    Reaction {
        conversation_id: ConversationId,
        message_id: MessageId,
        emoji: String,
        op: ReactionOp,
    },

    /// Liveness probe; the server answers with [`ServerFrame::Pong`].
    Ping,
}

/// Payload of [`ClientFrame::Message`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendMessage {
    pub conversation_id: ConversationId,
    pub content: String,
    /// Direct-message recipient, for non-group conversations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    /// Parent message when replying in a thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub priority: MessagePriority,
}

/// Frames the server emits to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame on every new connection.
    ConnectionAck {
        connection_id: ConnectionId,
        user_id: UserId,
    },

    /// A new message delivered to a participant.
    Message(MessageView),

    /// Acknowledgement to the sender that their message was persisted.
    MessageSent(MessageView),

    /// An existing message was edited.
    MessageUpdated(MessageView),

    /// A message was soft-deleted by its sender or an admin.
    MessageRetracted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },

    ConversationJoined {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    ConversationLeft {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    /// One user's typing state changed.
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },

    /// Full set of users currently typing in a conversation.
    TypingUsers {
        conversation_id: ConversationId,
        users: Vec<UserId>,
    },

    ReadReceipt {
        conversation_id: ConversationId,
        user_id: UserId,
        message_ids: Vec<MessageId>,
    },

    /// Reaction delta plus the resulting per-emoji counts.
    Reaction {
        conversation_id: ConversationId,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
        op: ReactionOp,
        counts: Vec<ReactionCount>,
    },

    Presence {
        user_id: UserId,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    },

    Pong { timestamp: DateTime<Utc> },

    /// Periodic server-initiated liveness frame.
    Heartbeat { timestamp: DateTime<Utc> },

    /// Recoverable per-frame error; the connection stays open.
    Error { message: String },

    /// The intended recipient has blocked the sender.
    UserBlocked { user_id: UserId },
}

/// Aggregated reaction count for one emoji on one message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReactionCount {
    pub emoji: String,
    pub count: u32,
}

/// A message enriched for delivery: row fields plus attachments, reaction
/// counts, and the caller's read state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageView {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    pub content: String,
    pub kind: MessageKind,
    pub priority: MessagePriority,
    pub is_edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<AttachmentView>,
    #[serde(default)]
    pub reactions: Vec<ReactionCount>,
    /// Whether the receiving user has read this message.
    #[serde(default)]
    pub read: bool,
}

/// Attachment metadata as exposed on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachmentView {
    pub id: uuid::Uuid,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

impl ClientFrame {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerFrame {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_tagged_shape() {
        let frame = ClientFrame::Typing {
            conversation_id: ConversationId::new(),
            is_typing: true,
        };
        let json: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "typing");
        assert_eq!(json["data"]["is_typing"], true);
    }

    #[test]
    fn send_message_defaults() {
        let conversation_id = ConversationId::new();
        let text = format!(
            r#"{{"type":"message","data":{{"conversation_id":"{}","content":"hello"}}}}"#,
            conversation_id.0
        );
        let frame = ClientFrame::from_json(&text).unwrap();
        match frame {
            ClientFrame::Message(msg) => {
                assert_eq!(msg.content, "hello");
                assert_eq!(msg.kind, MessageKind::Text);
                assert_eq!(msg.priority, MessagePriority::Normal);
                assert!(msg.recipient_id.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = ClientFrame::from_json(r#"{"type":"teleport","data":{}}"#);
        assert!(err.is_err());
    }

    #[test]
    fn server_frame_round_trip() {
        let frame = ServerFrame::Typing {
            conversation_id: ConversationId::new(),
            user_id: UserId::new(),
            is_typing: false,
        };
        let restored = ServerFrame::from_json(&frame.to_json().unwrap()).unwrap();
        assert_eq!(frame, restored);
    }
}
