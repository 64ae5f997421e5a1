//! v001 -- Initial schema creation.
//!
//! Creates the messaging core tables: `conversations`,
//! `conversation_participants`, `messages`, `message_attachments`,
//! `message_reactions`, and `message_read_receipts`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id                TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    title             TEXT,
    is_group          INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    creator_id        TEXT NOT NULL,              -- UUID of creating user
    project_id        TEXT,                       -- optional associated project
    -- For direct conversations: "min_user:max_user[:project]".  The UNIQUE
    -- constraint makes concurrent create-or-get race-free.
    direct_key        TEXT UNIQUE,
    last_message_id   TEXT,
    last_message_at   TEXT,
    is_encrypted      INTEGER NOT NULL DEFAULT 0,
    encryption_key_id TEXT,                       -- opaque key handle
    metadata          TEXT,                       -- JSON object
    created_at        TEXT NOT NULL,              -- ISO-8601 / RFC-3339
    updated_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_last_message_at
    ON conversations(last_message_at DESC);

-- ----------------------------------------------------------------
-- Participants
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversation_participants (
    conversation_id TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    role            TEXT NOT NULL DEFAULT 'member', -- admin|member|viewer
    is_active       INTEGER NOT NULL DEFAULT 1,
    joined_at       TEXT NOT NULL,
    left_at         TEXT,
    is_muted        INTEGER NOT NULL DEFAULT 0,
    last_read_at    TEXT,
    public_key      TEXT,                           -- optional encryption key

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_participants_user ON conversation_participants(user_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
-- `seq` is the authoritative ordering within a conversation: a message's
-- position is fixed once persisted, independent of arrival order at any
-- broadcaster instance.
CREATE TABLE IF NOT EXISTS messages (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    id              TEXT NOT NULL UNIQUE,           -- UUID v4
    conversation_id TEXT NOT NULL,
    sender_id       TEXT NOT NULL,
    recipient_id    TEXT,                           -- direct-message recipient
    parent_id       TEXT,                           -- threading
    content         TEXT NOT NULL,                  -- plaintext or opaque ciphertext
    kind            TEXT NOT NULL DEFAULT 'text',   -- text|system|event
    priority        TEXT NOT NULL DEFAULT 'normal', -- low|normal|high
    is_edited       INTEGER NOT NULL DEFAULT 0,
    edited_at       TEXT,
    is_deleted      INTEGER NOT NULL DEFAULT 0,
    deleted_at      TEXT,
    expires_at      TEXT,
    metadata        TEXT,                           -- JSON object
    sent_at         TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq
    ON messages(conversation_id, seq DESC);

-- ----------------------------------------------------------------
-- Attachments
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS message_attachments (
    id          TEXT PRIMARY KEY NOT NULL,          -- UUID v4
    message_id  TEXT NOT NULL,
    file_name   TEXT NOT NULL,
    mime_type   TEXT NOT NULL,
    size_bytes  INTEGER NOT NULL,
    storage_key TEXT NOT NULL,                      -- opaque storage locator
    thumbnail   TEXT,
    scan_status TEXT NOT NULL DEFAULT 'pending',
    created_at  TEXT NOT NULL,

    FOREIGN KEY (message_id) REFERENCES messages(id)
);

CREATE INDEX IF NOT EXISTS idx_attachments_message ON message_attachments(message_id);

-- ----------------------------------------------------------------
-- Reactions
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS message_reactions (
    id         TEXT PRIMARY KEY NOT NULL,           -- UUID v4
    message_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    emoji      TEXT NOT NULL,
    created_at TEXT NOT NULL,

    UNIQUE (message_id, user_id, emoji),
    FOREIGN KEY (message_id) REFERENCES messages(id)
);

-- ----------------------------------------------------------------
-- Read receipts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS message_read_receipts (
    message_id   TEXT NOT NULL,
    user_id      TEXT NOT NULL,
    kind         TEXT NOT NULL DEFAULT 'read',      -- delivery|read
    delivered_at TEXT NOT NULL,
    read_at      TEXT,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id)
);

CREATE INDEX IF NOT EXISTS idx_receipts_user ON message_read_receipts(user_id);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
