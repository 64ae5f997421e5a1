//! CRUD operations for [`Conversation`] records.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use courier_shared::{ConversationId, MessageId, ParticipantRole, UserId};

use crate::database::{parse_ts_col, parse_uuid_col, Database};
use crate::error::{Result, StoreError};
use crate::models::{direct_key, Conversation, ConversationFilter};

const CONVERSATION_COLS: &str = "id, title, is_group, creator_id, project_id, last_message_id, \
     last_message_at, is_encrypted, encryption_key_id, metadata, created_at, updated_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new group conversation and its initial participants.
    ///
    /// The creator is always added as an admin, the rest as members.
    pub fn create_group_conversation(
        &self,
        title: Option<&str>,
        creator_id: UserId,
        project_id: Option<Uuid>,
        members: &[UserId],
    ) -> Result<Conversation> {
        let id = ConversationId::new();
        let now = Utc::now();

        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO conversations (id, title, is_group, creator_id, project_id, created_at, updated_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?5, ?5)",
            params![
                id.to_string(),
                title,
                creator_id.to_string(),
                project_id.map(|p| p.to_string()),
                now.to_rfc3339(),
            ],
        )?;

        insert_participant(&tx, id, creator_id, ParticipantRole::Admin, now)?;
        for member in members {
            if *member != creator_id {
                insert_participant(&tx, id, *member, ParticipantRole::Member, now)?;
            }
        }
        tx.commit()?;

        self.get_conversation(id)
    }

    /// Find or create the direct conversation for an unordered user pair,
    /// optionally scoped by project.
    ///
    /// Idempotent under concurrent calls: creation races resolve through the
    /// UNIQUE `direct_key` constraint, after which both callers read the same
    /// row.  Returns the conversation and whether this call created it.
    pub fn find_or_create_direct(
        &self,
        creator_id: UserId,
        other_id: UserId,
        project_id: Option<Uuid>,
    ) -> Result<(Conversation, bool)> {
        let key = direct_key(creator_id, other_id, project_id);
        let id = ConversationId::new();
        let now = Utc::now();

        let tx = self.conn().unchecked_transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO conversations
                 (id, is_group, creator_id, project_id, direct_key, created_at, updated_at)
             VALUES (?1, 0, ?2, ?3, ?4, ?5, ?5)",
            params![
                id.to_string(),
                creator_id.to_string(),
                project_id.map(|p| p.to_string()),
                key,
                now.to_rfc3339(),
            ],
        )?;

        if inserted == 1 {
            insert_participant(&tx, id, creator_id, ParticipantRole::Admin, now)?;
            insert_participant(&tx, id, other_id, ParticipantRole::Member, now)?;
        }
        tx.commit()?;

        let conversation = self
            .conn()
            .query_row(
                &format!("SELECT {CONVERSATION_COLS} FROM conversations WHERE direct_key = ?1"),
                params![key],
                row_to_conversation,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;

        Ok((conversation, inserted == 1))
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single conversation by id.
    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.conn()
            .query_row(
                &format!("SELECT {CONVERSATION_COLS} FROM conversations WHERE id = ?1"),
                params![id.to_string()],
                row_to_conversation,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// List a user's conversations, most recently active first.
    ///
    /// Archived/muted filters consult the user's per-conversation settings;
    /// an absent settings row reads as not-archived, not-muted.
    pub fn list_conversations_for_user(
        &self,
        user_id: UserId,
        filter: &ConversationFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Conversation>> {
        let mut sql = format!(
            "SELECT {} FROM conversations c
             JOIN conversation_participants p
               ON p.conversation_id = c.id AND p.user_id = ?1 AND p.is_active = 1
             LEFT JOIN conversation_settings s
               ON s.conversation_id = c.id AND s.user_id = ?1
             WHERE 1 = 1",
            CONVERSATION_COLS
                .split(", ")
                .map(|col| format!("c.{col}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(user_id.to_string())];

        if let Some(archived) = filter.archived {
            sql.push_str(" AND COALESCE(s.is_archived, 0) = ?");
            args.push(Box::new(archived as i64));
        }
        if let Some(muted) = filter.muted {
            sql.push_str(" AND COALESCE(s.is_muted, 0) = ?");
            args.push(Box::new(muted as i64));
        }
        if let Some(is_group) = filter.is_group {
            sql.push_str(" AND c.is_group = ?");
            args.push(Box::new(is_group as i64));
        }
        if let Some(ref search) = filter.search {
            sql.push_str(" AND c.title LIKE '%' || ? || '%'");
            args.push(Box::new(search.clone()));
        }

        sql.push_str(" ORDER BY COALESCE(c.last_message_at, c.created_at) DESC LIMIT ? OFFSET ?");
        args.push(Box::new(limit));
        args.push(Box::new(offset));

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            row_to_conversation,
        )?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Advance the conversation's last-message pointer.
    pub fn update_last_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE conversations
             SET last_message_id = ?2, last_message_at = ?3, updated_at = ?3
             WHERE id = ?1",
            params![
                conversation_id.to_string(),
                message_id.to_string(),
                at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

fn insert_participant(
    tx: &rusqlite::Transaction<'_>,
    conversation_id: ConversationId,
    user_id: UserId,
    role: ParticipantRole,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO conversation_participants (conversation_id, user_id, role, is_active, joined_at)
         VALUES (?1, ?2, ?3, 1, ?4)",
        params![
            conversation_id.to_string(),
            user_id.to_string(),
            role.as_str(),
            now.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id_str: String = row.get(0)?;
    let title: Option<String> = row.get(1)?;
    let is_group: bool = row.get(2)?;
    let creator_str: String = row.get(3)?;
    let project_str: Option<String> = row.get(4)?;
    let last_message_str: Option<String> = row.get(5)?;
    let last_message_at_str: Option<String> = row.get(6)?;
    let is_encrypted: bool = row.get(7)?;
    let encryption_key_id: Option<String> = row.get(8)?;
    let metadata_str: Option<String> = row.get(9)?;
    let created_str: String = row.get(10)?;
    let updated_str: String = row.get(11)?;

    let metadata = match metadata_str {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };

    Ok(Conversation {
        id: ConversationId(parse_uuid_col(0, &id_str)?),
        title,
        is_group,
        creator_id: UserId(parse_uuid_col(3, &creator_str)?),
        project_id: project_str
            .map(|s| parse_uuid_col(4, &s))
            .transpose()?,
        last_message_id: last_message_str
            .map(|s| parse_uuid_col(5, &s).map(MessageId))
            .transpose()?,
        last_message_at: last_message_at_str
            .map(|s| parse_ts_col(6, &s))
            .transpose()?,
        is_encrypted,
        encryption_key_id,
        metadata,
        created_at: parse_ts_col(10, &created_str)?,
        updated_at: parse_ts_col(11, &updated_str)?,
    })
}
