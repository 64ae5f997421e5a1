//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the API layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier_shared::{
    ConversationId, MessageId, MessageKind, MessagePriority, ParticipantRole, ReceiptKind, UserId,
};

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// An addressable thread of messages among a participant set.
///
/// A direct (non-group) conversation has exactly two active participants and
/// carries a `direct_key` so at most one exists per unordered user pair
/// (optionally scoped by project).  Conversations are never hard-deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: Option<String>,
    pub is_group: bool,
    pub creator_id: UserId,
    pub project_id: Option<Uuid>,
    pub last_message_id: Option<MessageId>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub is_encrypted: bool,
    /// Opaque handle into the external key-management capability.
    pub encryption_key_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Canonical unique key for a direct conversation between two users.
///
/// The pair is unordered: `direct_key(a, b, p) == direct_key(b, a, p)`.
pub fn direct_key(a: UserId, b: UserId, project_id: Option<Uuid>) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    match project_id {
        Some(project) => format!("{lo}:{hi}:{project}"),
        None => format!("{lo}:{hi}"),
    }
}

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

/// A user's membership record in a conversation.
///
/// Removal is a soft transition (`is_active = false`, `left_at` set) so
/// history is preserved; a rejoining user reactivates the same row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub role: ParticipantRole,
    pub is_active: bool,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub is_muted: bool,
    pub last_read_at: Option<DateTime<Utc>>,
    /// Optional encryption public key for the opaque encryption capability.
    pub public_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single persisted message.
///
/// `seq` is assigned by the store and fixes the message's position within
/// its conversation.  Deleted messages keep their row (`is_deleted = true`)
/// for audit; edits never mutate `sent_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub seq: i64,
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub recipient_id: Option<UserId>,
    pub parent_id: Option<MessageId>,
    pub content: String,
    pub kind: MessageKind,
    pub priority: MessagePriority,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    pub sent_at: DateTime<Utc>,
}

/// Fields required to insert a new message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub recipient_id: Option<UserId>,
    pub parent_id: Option<MessageId>,
    pub content: String,
    pub kind: MessageKind,
    pub priority: MessagePriority,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

/// Filters for paginated message history queries.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    /// Only messages with `seq` strictly below this (pagination cursor).
    pub before_seq: Option<i64>,
    pub sender_id: Option<UserId>,
    pub kind: Option<MessageKind>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Case-insensitive substring match on content.
    pub text: Option<String>,
}

// ---------------------------------------------------------------------------
// Attachment
// ---------------------------------------------------------------------------

/// File metadata owned by exactly one message.  Deleting a message does not
/// delete attachment storage (soft-delete parity).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub id: Uuid,
    pub message_id: MessageId,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    /// Opaque locator into the external blob storage.
    pub storage_key: String,
    pub thumbnail: Option<String>,
    pub scan_status: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Reaction
// ---------------------------------------------------------------------------

/// One user's emoji reaction on one message; unique per (message, user, emoji).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reaction {
    pub id: Uuid,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Read receipt
// ---------------------------------------------------------------------------

/// Delivery/read state for one (message, user) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadReceipt {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub kind: ReceiptKind,
    pub delivered_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Per-user conversation settings
// ---------------------------------------------------------------------------

/// A user's archive/mute toggles for a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationSetting {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub is_archived: bool,
    pub is_muted: bool,
    pub updated_at: DateTime<Utc>,
}

/// Filters for a user's conversation listing.
#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub archived: Option<bool>,
    pub muted: Option<bool>,
    pub is_group: Option<bool>,
    /// Case-insensitive substring match on the title.
    pub search: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_key_is_order_insensitive() {
        let a = UserId::new();
        let b = UserId::new();
        assert_eq!(direct_key(a, b, None), direct_key(b, a, None));

        let project = Uuid::new_v4();
        assert_eq!(direct_key(a, b, Some(project)), direct_key(b, a, Some(project)));
        assert_ne!(direct_key(a, b, None), direct_key(a, b, Some(project)));
    }
}
