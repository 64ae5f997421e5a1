//! CRUD operations for [`Participant`] records.
//!
//! Membership is never hard-deleted: leaving flips `is_active` and stamps
//! `left_at`, and a rejoining user reactivates the same row.

use chrono::{DateTime, Utc};
use rusqlite::params;

use courier_shared::{ConversationId, ParticipantRole, UserId};

use crate::database::{parse_ts_col, parse_uuid_col, Database};
use crate::error::{Result, StoreError};
use crate::models::Participant;

const PARTICIPANT_COLS: &str = "conversation_id, user_id, role, is_active, joined_at, left_at, \
     is_muted, last_read_at, public_key";

impl Database {
    /// Add a user to a conversation, or reactivate their previous membership.
    pub fn add_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        role: ParticipantRole,
    ) -> Result<Participant> {
        let now = Utc::now();
        self.conn().execute(
            "INSERT INTO conversation_participants (conversation_id, user_id, role, is_active, joined_at)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT (conversation_id, user_id)
             DO UPDATE SET is_active = 1, left_at = NULL, role = excluded.role",
            params![
                conversation_id.to_string(),
                user_id.to_string(),
                role.as_str(),
                now.to_rfc3339(),
            ],
        )?;
        self.get_participant(conversation_id, user_id)
    }

    /// Soft-remove a participant.  Their history stays intact.
    pub fn remove_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE conversation_participants
             SET is_active = 0, left_at = ?3
             WHERE conversation_id = ?1 AND user_id = ?2 AND is_active = 1",
            params![
                conversation_id.to_string(),
                user_id.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(affected > 0)
    }

    /// Fetch one membership row.
    pub fn get_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Participant> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {PARTICIPANT_COLS} FROM conversation_participants
                     WHERE conversation_id = ?1 AND user_id = ?2"
                ),
                params![conversation_id.to_string(), user_id.to_string()],
                row_to_participant,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// List a conversation's participants, optionally active-only.
    pub fn get_participants(
        &self,
        conversation_id: ConversationId,
        active_only: bool,
    ) -> Result<Vec<Participant>> {
        let sql = if active_only {
            format!(
                "SELECT {PARTICIPANT_COLS} FROM conversation_participants
                 WHERE conversation_id = ?1 AND is_active = 1 ORDER BY joined_at ASC"
            )
        } else {
            format!(
                "SELECT {PARTICIPANT_COLS} FROM conversation_participants
                 WHERE conversation_id = ?1 ORDER BY joined_at ASC"
            )
        };
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![conversation_id.to_string()], row_to_participant)?;

        let mut participants = Vec::new();
        for row in rows {
            participants.push(row?);
        }
        Ok(participants)
    }

    /// Authorization primitive: is this user an active participant?
    pub fn is_active_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM conversation_participants
             WHERE conversation_id = ?1 AND user_id = ?2 AND is_active = 1",
            params![conversation_id.to_string(), user_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Distinct users who share at least one active conversation with the
    /// given user.  Used to fan presence changes out to a user's partners.
    pub fn co_participants(&self, user_id: UserId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT DISTINCT p.user_id FROM conversation_participants p
             WHERE p.is_active = 1
               AND p.user_id != ?1
               AND p.conversation_id IN (
                   SELECT conversation_id FROM conversation_participants
                   WHERE user_id = ?1 AND is_active = 1
               )",
        )?;
        let rows = stmt.query_map(params![user_id.to_string()], |row| {
            let user_str: String = row.get(0)?;
            Ok(UserId(parse_uuid_col(0, &user_str)?))
        })?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// Advance the participant's last-read watermark.
    pub fn set_last_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE conversation_participants SET last_read_at = ?3
             WHERE conversation_id = ?1 AND user_id = ?2",
            params![
                conversation_id.to_string(),
                user_id.to_string(),
                at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

fn row_to_participant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Participant> {
    let conversation_str: String = row.get(0)?;
    let user_str: String = row.get(1)?;
    let role_str: String = row.get(2)?;
    let is_active: bool = row.get(3)?;
    let joined_str: String = row.get(4)?;
    let left_str: Option<String> = row.get(5)?;
    let is_muted: bool = row.get(6)?;
    let last_read_str: Option<String> = row.get(7)?;
    let public_key: Option<String> = row.get(8)?;

    let role = ParticipantRole::parse(&role_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown role: {role_str}").into(),
        )
    })?;

    Ok(Participant {
        conversation_id: ConversationId(parse_uuid_col(0, &conversation_str)?),
        user_id: UserId(parse_uuid_col(1, &user_str)?),
        role,
        is_active,
        joined_at: parse_ts_col(4, &joined_str)?,
        left_at: left_str.map(|s| parse_ts_col(5, &s)).transpose()?,
        is_muted,
        last_read_at: last_read_str.map(|s| parse_ts_col(7, &s)).transpose()?,
        public_key,
    })
}
