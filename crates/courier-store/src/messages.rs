//! CRUD operations for [`Message`] records.
//!
//! History reads exclude soft-deleted rows; the rows themselves are kept for
//! audit.  Ordering is by the store-assigned `seq`, descending.

use chrono::Utc;
use rusqlite::params;

use courier_shared::{ConversationId, MessageId, MessageKind, MessagePriority, UserId};

use crate::database::{parse_ts_col, parse_uuid_col, Database};
use crate::error::{Result, StoreError};
use crate::models::{Message, MessageFilter, NewMessage};

const MESSAGE_COLS: &str = "seq, id, conversation_id, sender_id, recipient_id, parent_id, \
     content, kind, priority, is_edited, edited_at, is_deleted, deleted_at, expires_at, \
     metadata, sent_at";

impl Database {
    /// Persist a new message and return it with its assigned `seq`.
    pub fn insert_message(&self, new: &NewMessage) -> Result<Message> {
        let now = Utc::now();
        self.conn().execute(
            "INSERT INTO messages
                 (id, conversation_id, sender_id, recipient_id, parent_id, content, kind,
                  priority, expires_at, metadata, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                new.id.to_string(),
                new.conversation_id.to_string(),
                new.sender_id.to_string(),
                new.recipient_id.map(|u| u.to_string()),
                new.parent_id.map(|m| m.to_string()),
                new.content,
                new.kind.as_str(),
                new.priority.as_str(),
                new.expires_at.map(|t| t.to_rfc3339()),
                new.metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                now.to_rfc3339(),
            ],
        )?;
        self.get_message(new.id)
    }

    /// Fetch a single message by id, deleted or not.
    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Paginated reverse-chronological history for a conversation.
    ///
    /// Soft-deleted messages are excluded.  `filter.before_seq` is the
    /// pagination cursor; pass the smallest `seq` of the previous page.
    pub fn list_messages(
        &self,
        conversation_id: ConversationId,
        filter: &MessageFilter,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let mut sql = format!(
            "SELECT {MESSAGE_COLS} FROM messages
             WHERE conversation_id = ? AND is_deleted = 0"
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(conversation_id.to_string())];

        if let Some(before) = filter.before_seq {
            sql.push_str(" AND seq < ?");
            args.push(Box::new(before));
        }
        if let Some(sender) = filter.sender_id {
            sql.push_str(" AND sender_id = ?");
            args.push(Box::new(sender.to_string()));
        }
        if let Some(kind) = filter.kind {
            sql.push_str(" AND kind = ?");
            args.push(Box::new(kind.as_str()));
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND sent_at >= ?");
            args.push(Box::new(since.to_rfc3339()));
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND sent_at <= ?");
            args.push(Box::new(until.to_rfc3339()));
        }
        if let Some(ref text) = filter.text {
            sql.push_str(" AND content LIKE '%' || ? || '%'");
            args.push(Box::new(text.clone()));
        }

        sql.push_str(" ORDER BY seq DESC LIMIT ?");
        args.push(Box::new(limit));

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Replace a message's content, stamping the edit.  `sent_at` is never
    /// touched.
    pub fn edit_message(&self, id: MessageId, content: &str) -> Result<Message> {
        let affected = self.conn().execute(
            "UPDATE messages SET content = ?2, is_edited = 1, edited_at = ?3
             WHERE id = ?1 AND is_deleted = 0",
            params![id.to_string(), content, Utc::now().to_rfc3339()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        self.get_message(id)
    }

    /// Soft-delete a message.  The row is retained for audit.
    pub fn soft_delete_message(&self, id: MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET is_deleted = 1, deleted_at = ?2
             WHERE id = ?1 AND is_deleted = 0",
            params![id.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let seq: i64 = row.get(0)?;
    let id_str: String = row.get(1)?;
    let conversation_str: String = row.get(2)?;
    let sender_str: String = row.get(3)?;
    let recipient_str: Option<String> = row.get(4)?;
    let parent_str: Option<String> = row.get(5)?;
    let content: String = row.get(6)?;
    let kind_str: String = row.get(7)?;
    let priority_str: String = row.get(8)?;
    let is_edited: bool = row.get(9)?;
    let edited_str: Option<String> = row.get(10)?;
    let is_deleted: bool = row.get(11)?;
    let deleted_str: Option<String> = row.get(12)?;
    let expires_str: Option<String> = row.get(13)?;
    let metadata_str: Option<String> = row.get(14)?;
    let sent_str: String = row.get(15)?;

    let kind = MessageKind::parse(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            format!("unknown message kind: {kind_str}").into(),
        )
    })?;
    let priority = MessagePriority::parse(&priority_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            rusqlite::types::Type::Text,
            format!("unknown priority: {priority_str}").into(),
        )
    })?;
    let metadata = match metadata_str {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(14, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };

    Ok(Message {
        seq,
        id: MessageId(parse_uuid_col(1, &id_str)?),
        conversation_id: ConversationId(parse_uuid_col(2, &conversation_str)?),
        sender_id: UserId(parse_uuid_col(3, &sender_str)?),
        recipient_id: recipient_str
            .map(|s| parse_uuid_col(4, &s).map(UserId))
            .transpose()?,
        parent_id: parent_str
            .map(|s| parse_uuid_col(5, &s).map(MessageId))
            .transpose()?,
        content,
        kind,
        priority,
        is_edited,
        edited_at: edited_str.map(|s| parse_ts_col(10, &s)).transpose()?,
        is_deleted,
        deleted_at: deleted_str.map(|s| parse_ts_col(12, &s)).transpose()?,
        expires_at: expires_str.map(|s| parse_ts_col(13, &s)).transpose()?,
        metadata,
        sent_at: parse_ts_col(15, &sent_str)?,
    })
}
