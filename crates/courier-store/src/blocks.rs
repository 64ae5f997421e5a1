//! Blocked-user pairs and per-user conversation settings.

use chrono::Utc;
use rusqlite::params;

use courier_shared::{ConversationId, UserId};

use crate::database::{parse_ts_col, parse_uuid_col, Database};
use crate::error::Result;
use crate::models::ConversationSetting;

impl Database {
    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    pub fn block_user(&self, blocker_id: UserId, blocked_id: UserId) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO blocked_users (blocker_id, blocked_id, created_at)
             VALUES (?1, ?2, ?3)",
            params![
                blocker_id.to_string(),
                blocked_id.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn unblock_user(&self, blocker_id: UserId, blocked_id: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM blocked_users WHERE blocker_id = ?1 AND blocked_id = ?2",
            params![blocker_id.to_string(), blocked_id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Whether `blocker_id` has blocked `blocked_id`.
    pub fn is_blocked(&self, blocker_id: UserId, blocked_id: UserId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM blocked_users WHERE blocker_id = ?1 AND blocked_id = ?2",
            params![blocker_id.to_string(), blocked_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ------------------------------------------------------------------
    // Per-user conversation settings
    // ------------------------------------------------------------------

    /// Upsert the user's archive/mute toggles.  `None` leaves the existing
    /// value untouched.
    pub fn set_conversation_setting(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        archived: Option<bool>,
        muted: Option<bool>,
    ) -> Result<ConversationSetting> {
        let now = Utc::now();
        self.conn().execute(
            "INSERT INTO conversation_settings
                 (conversation_id, user_id, is_archived, is_muted, updated_at)
             VALUES (?1, ?2, COALESCE(?3, 0), COALESCE(?4, 0), ?5)
             ON CONFLICT (conversation_id, user_id)
             DO UPDATE SET
                 is_archived = COALESCE(?3, is_archived),
                 is_muted = COALESCE(?4, is_muted),
                 updated_at = ?5",
            params![
                conversation_id.to_string(),
                user_id.to_string(),
                archived,
                muted,
                now.to_rfc3339(),
            ],
        )?;
        self.get_conversation_setting(conversation_id, user_id)
    }

    /// Read the user's settings, defaulting to not-archived / not-muted.
    pub fn get_conversation_setting(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<ConversationSetting> {
        let found = self
            .conn()
            .query_row(
                "SELECT conversation_id, user_id, is_archived, is_muted, updated_at
                 FROM conversation_settings WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id.to_string(), user_id.to_string()],
                |row| {
                    let conversation_str: String = row.get(0)?;
                    let user_str: String = row.get(1)?;
                    let updated_str: String = row.get(4)?;
                    Ok(ConversationSetting {
                        conversation_id: ConversationId(parse_uuid_col(0, &conversation_str)?),
                        user_id: UserId(parse_uuid_col(1, &user_str)?),
                        is_archived: row.get(2)?,
                        is_muted: row.get(3)?,
                        updated_at: parse_ts_col(4, &updated_str)?,
                    })
                },
            );

        match found {
            Ok(setting) => Ok(setting),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(ConversationSetting {
                conversation_id,
                user_id,
                is_archived: false,
                is_muted: false,
                updated_at: Utc::now(),
            }),
            Err(other) => Err(other.into()),
        }
    }
}
