//! CRUD operations for [`Reaction`] records.
//!
//! The UNIQUE (message_id, user_id, emoji) index makes adds idempotent: a
//! user reacts at most once per emoji per message.

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use courier_shared::envelope::ReactionCount;
use courier_shared::{MessageId, UserId};

use crate::database::{parse_ts_col, parse_uuid_col, Database};
use crate::error::Result;
use crate::models::Reaction;

impl Database {
    /// Add a reaction.  Returns `false` when the identical reaction already
    /// existed (idempotent upsert).
    pub fn add_reaction(&self, message_id: MessageId, user_id: UserId, emoji: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO message_reactions (id, message_id, user_id, emoji, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                message_id.to_string(),
                user_id.to_string(),
                emoji,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(affected > 0)
    }

    /// Remove a reaction.  Returns `false` when there was nothing to remove.
    pub fn remove_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM message_reactions
             WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
            params![message_id.to_string(), user_id.to_string(), emoji],
        )?;
        Ok(affected > 0)
    }

    pub fn get_reactions_for_message(&self, message_id: MessageId) -> Result<Vec<Reaction>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, message_id, user_id, emoji, created_at
             FROM message_reactions WHERE message_id = ?1 ORDER BY created_at ASC",
        )?;

        let rows = stmt.query_map(params![message_id.to_string()], |row| {
            let id_str: String = row.get(0)?;
            let message_str: String = row.get(1)?;
            let user_str: String = row.get(2)?;
            let emoji: String = row.get(3)?;
            let created_str: String = row.get(4)?;

            Ok(Reaction {
                id: parse_uuid_col(0, &id_str)?,
                message_id: MessageId(parse_uuid_col(1, &message_str)?),
                user_id: UserId(parse_uuid_col(2, &user_str)?),
                emoji,
                created_at: parse_ts_col(4, &created_str)?,
            })
        })?;

        let mut reactions = Vec::new();
        for row in rows {
            reactions.push(row?);
        }
        Ok(reactions)
    }

    /// Per-emoji counts for one message, highest first.
    pub fn reaction_counts(&self, message_id: MessageId) -> Result<Vec<ReactionCount>> {
        let mut stmt = self.conn().prepare(
            "SELECT emoji, COUNT(*) FROM message_reactions
             WHERE message_id = ?1 GROUP BY emoji ORDER BY COUNT(*) DESC, emoji ASC",
        )?;
        let rows = stmt.query_map(params![message_id.to_string()], |row| {
            Ok(ReactionCount {
                emoji: row.get(0)?,
                count: row.get(1)?,
            })
        })?;

        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_shared::MessageKind;
    use courier_shared::MessagePriority;

    fn seed_message(db: &Database) -> (MessageId, UserId) {
        let a = UserId::new();
        let b = UserId::new();
        let conversation = db.find_or_create_direct(a, b, None).unwrap().0;
        let message = db
            .insert_message(&crate::models::NewMessage {
                id: MessageId::new(),
                conversation_id: conversation.id,
                sender_id: a,
                recipient_id: Some(b),
                parent_id: None,
                content: "hi".into(),
                kind: MessageKind::Text,
                priority: MessagePriority::Normal,
                expires_at: None,
                metadata: None,
            })
            .unwrap();
        (message.id, b)
    }

    #[test]
    fn duplicate_reaction_leaves_one_row() {
        let db = Database::open_in_memory().unwrap();
        let (message_id, user) = seed_message(&db);

        assert!(db.add_reaction(message_id, user, "👍").unwrap());
        assert!(!db.add_reaction(message_id, user, "👍").unwrap());

        let reactions = db.get_reactions_for_message(message_id).unwrap();
        assert_eq!(reactions.len(), 1);

        // Distinct emoji from the same user is allowed.
        assert!(db.add_reaction(message_id, user, "🎉").unwrap());
        assert_eq!(db.get_reactions_for_message(message_id).unwrap().len(), 2);
    }

    #[test]
    fn double_remove_is_noop() {
        let db = Database::open_in_memory().unwrap();
        let (message_id, user) = seed_message(&db);

        db.add_reaction(message_id, user, "👍").unwrap();
        assert!(db.remove_reaction(message_id, user, "👍").unwrap());
        assert!(!db.remove_reaction(message_id, user, "👍").unwrap());
    }

    #[test]
    fn counts_group_by_emoji() {
        let db = Database::open_in_memory().unwrap();
        let (message_id, user) = seed_message(&db);
        let other = UserId::new();

        db.add_reaction(message_id, user, "👍").unwrap();
        db.add_reaction(message_id, other, "👍").unwrap();
        db.add_reaction(message_id, user, "🎉").unwrap();

        let counts = db.reaction_counts(message_id).unwrap();
        assert_eq!(counts[0].emoji, "👍");
        assert_eq!(counts[0].count, 2);
        assert_eq!(counts[1].count, 1);
    }
}
