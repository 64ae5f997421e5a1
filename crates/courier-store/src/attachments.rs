//! CRUD operations for [`Attachment`] records.
//!
//! An attachment belongs to exactly one message.  Deleting a message does
//! not touch attachment storage; the scan status field is written by the
//! external scanning collaborator.

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use courier_shared::MessageId;

use crate::database::{parse_ts_col, parse_uuid_col, Database};
use crate::error::{Result, StoreError};
use crate::models::Attachment;

impl Database {
    pub fn insert_attachment(
        &self,
        message_id: MessageId,
        file_name: &str,
        mime_type: &str,
        size_bytes: i64,
        storage_key: &str,
        thumbnail: Option<&str>,
    ) -> Result<Attachment> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        self.conn().execute(
            "INSERT INTO message_attachments
                 (id, message_id, file_name, mime_type, size_bytes, storage_key, thumbnail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id.to_string(),
                message_id.to_string(),
                file_name,
                mime_type,
                size_bytes,
                storage_key,
                thumbnail,
                now.to_rfc3339(),
            ],
        )?;

        self.get_attachment(id)
    }

    pub fn get_attachment(&self, id: Uuid) -> Result<Attachment> {
        self.conn()
            .query_row(
                "SELECT id, message_id, file_name, mime_type, size_bytes, storage_key,
                        thumbnail, scan_status, created_at
                 FROM message_attachments WHERE id = ?1",
                params![id.to_string()],
                row_to_attachment,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn get_attachments_for_message(&self, message_id: MessageId) -> Result<Vec<Attachment>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, message_id, file_name, mime_type, size_bytes, storage_key,
                    thumbnail, scan_status, created_at
             FROM message_attachments WHERE message_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![message_id.to_string()], row_to_attachment)?;

        let mut attachments = Vec::new();
        for row in rows {
            attachments.push(row?);
        }
        Ok(attachments)
    }

    /// Record the verdict of the external attachment scanner.
    pub fn set_attachment_scan_status(&self, id: Uuid, scan_status: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE message_attachments SET scan_status = ?2 WHERE id = ?1",
            params![id.to_string(), scan_status],
        )?;
        Ok(())
    }
}

fn row_to_attachment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Attachment> {
    let id_str: String = row.get(0)?;
    let message_str: String = row.get(1)?;
    let created_str: String = row.get(8)?;

    Ok(Attachment {
        id: parse_uuid_col(0, &id_str)?,
        message_id: MessageId(parse_uuid_col(1, &message_str)?),
        file_name: row.get(2)?,
        mime_type: row.get(3)?,
        size_bytes: row.get(4)?,
        storage_key: row.get(5)?,
        thumbnail: row.get(6)?,
        scan_status: row.get(7)?,
        created_at: parse_ts_col(8, &created_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_shared::{MessageKind, MessagePriority, UserId};

    #[test]
    fn attachment_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let a = UserId::new();
        let b = UserId::new();
        let conversation = db.find_or_create_direct(a, b, None).unwrap().0;
        let message = db
            .insert_message(&crate::models::NewMessage {
                id: courier_shared::MessageId::new(),
                conversation_id: conversation.id,
                sender_id: a,
                recipient_id: Some(b),
                parent_id: None,
                content: "see attached".into(),
                kind: MessageKind::Text,
                priority: MessagePriority::Normal,
                expires_at: None,
                metadata: None,
            })
            .unwrap();

        let attachment = db
            .insert_attachment(message.id, "deck.pdf", "application/pdf", 1024, "blob/abc", None)
            .unwrap();
        assert_eq!(attachment.scan_status, "pending");

        db.set_attachment_scan_status(attachment.id, "clean").unwrap();
        let listed = db.get_attachments_for_message(message.id).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].scan_status, "clean");
    }
}
