//! CRUD operations for [`ReadReceipt`] records.
//!
//! One receipt per (message, user); upserts are last-write-wins on `read_at`
//! so marking read twice is harmless.

use chrono::Utc;
use rusqlite::params;

use courier_shared::{ConversationId, MessageId, ReceiptKind, UserId};

use crate::database::{parse_ts_col, parse_uuid_col, Database};
use crate::error::{Result, StoreError};
use crate::models::ReadReceipt;

impl Database {
    /// Record that a message reached a user's device.  No-op if a receipt
    /// already exists.
    pub fn upsert_delivery_receipt(&self, message_id: MessageId, user_id: UserId) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO message_read_receipts
                 (message_id, user_id, kind, delivered_at)
             VALUES (?1, ?2, 'delivery', ?3)",
            params![
                message_id.to_string(),
                user_id.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Mark a message read by a user, creating the receipt if the delivery
    /// leg never recorded one.
    pub fn mark_read(&self, message_id: MessageId, user_id: UserId) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO message_read_receipts (message_id, user_id, kind, delivered_at, read_at)
             VALUES (?1, ?2, 'read', ?3, ?3)
             ON CONFLICT (message_id, user_id)
             DO UPDATE SET kind = 'read', read_at = excluded.read_at",
            params![message_id.to_string(), user_id.to_string(), now],
        )?;
        Ok(())
    }

    pub fn get_receipt(&self, message_id: MessageId, user_id: UserId) -> Result<ReadReceipt> {
        self.conn()
            .query_row(
                "SELECT message_id, user_id, kind, delivered_at, read_at
                 FROM message_read_receipts WHERE message_id = ?1 AND user_id = ?2",
                params![message_id.to_string(), user_id.to_string()],
                row_to_receipt,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Whether the user has a read (not merely delivered) receipt.
    pub fn has_read(&self, message_id: MessageId, user_id: UserId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM message_read_receipts
             WHERE message_id = ?1 AND user_id = ?2 AND read_at IS NOT NULL",
            params![message_id.to_string(), user_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Count messages in a conversation the user has not read, excluding
    /// their own and soft-deleted ones.
    pub fn unread_count(&self, conversation_id: ConversationId, user_id: UserId) -> Result<i64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages m
             WHERE m.conversation_id = ?1
               AND m.is_deleted = 0
               AND m.sender_id != ?2
               AND NOT EXISTS (
                   SELECT 1 FROM message_read_receipts r
                   WHERE r.message_id = m.id AND r.user_id = ?2 AND r.read_at IS NOT NULL
               )",
            params![conversation_id.to_string(), user_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn row_to_receipt(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReadReceipt> {
    let message_str: String = row.get(0)?;
    let user_str: String = row.get(1)?;
    let kind_str: String = row.get(2)?;
    let delivered_str: String = row.get(3)?;
    let read_str: Option<String> = row.get(4)?;

    let kind = ReceiptKind::parse(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown receipt kind: {kind_str}").into(),
        )
    })?;

    Ok(ReadReceipt {
        message_id: MessageId(parse_uuid_col(0, &message_str)?),
        user_id: UserId(parse_uuid_col(1, &user_str)?),
        kind,
        delivered_at: parse_ts_col(3, &delivered_str)?,
        read_at: read_str.map(|s| parse_ts_col(4, &s)).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_shared::{MessageKind, MessagePriority};

    fn seed(db: &Database) -> (ConversationId, UserId, UserId) {
        let a = UserId::new();
        let b = UserId::new();
        let conversation = db.find_or_create_direct(a, b, None).unwrap().0;
        (conversation.id, a, b)
    }

    fn send(db: &Database, conversation_id: ConversationId, sender: UserId) -> MessageId {
        db.insert_message(&crate::models::NewMessage {
            id: MessageId::new(),
            conversation_id,
            sender_id: sender,
            recipient_id: None,
            parent_id: None,
            content: "x".into(),
            kind: MessageKind::Text,
            priority: MessagePriority::Normal,
            expires_at: None,
            metadata: None,
        })
        .unwrap()
        .id
    }

    #[test]
    fn mark_read_upgrades_delivery_receipt() {
        let db = Database::open_in_memory().unwrap();
        let (conversation_id, a, b) = seed(&db);
        let message_id = send(&db, conversation_id, a);

        db.upsert_delivery_receipt(message_id, b).unwrap();
        let receipt = db.get_receipt(message_id, b).unwrap();
        assert_eq!(receipt.kind, ReceiptKind::Delivery);
        assert!(receipt.read_at.is_none());

        db.mark_read(message_id, b).unwrap();
        let receipt = db.get_receipt(message_id, b).unwrap();
        assert_eq!(receipt.kind, ReceiptKind::Read);
        assert!(receipt.read_at.is_some());

        // Idempotent.
        db.mark_read(message_id, b).unwrap();
        assert!(db.has_read(message_id, b).unwrap());
    }

    #[test]
    fn unread_count_ignores_own_and_read_messages() {
        let db = Database::open_in_memory().unwrap();
        let (conversation_id, a, b) = seed(&db);

        let first = send(&db, conversation_id, a);
        send(&db, conversation_id, a);
        send(&db, conversation_id, b);

        assert_eq!(db.unread_count(conversation_id, b).unwrap(), 2);
        assert_eq!(db.unread_count(conversation_id, a).unwrap(), 1);

        db.mark_read(first, b).unwrap();
        assert_eq!(db.unread_count(conversation_id, b).unwrap(), 1);
    }
}
