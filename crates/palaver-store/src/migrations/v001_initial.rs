//! v001 -- Initial schema creation.
//!
//! Creates `users`, `chats`, `messages`, the two quota tables and
//! `user_preferences`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
///
/// Timestamps are fixed-width RFC-3339 UTC strings so that text comparison
/// matches chronological order.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (mirrored from the identity provider)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id         TEXT PRIMARY KEY NOT NULL,   -- UUID
    name       TEXT,
    email      TEXT,
    image      TEXT,
    role       TEXT NOT NULL,               -- guest | user | admin
    created_at TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Chats
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id         TEXT PRIMARY KEY NOT NULL,   -- UUID
    user_id    TEXT NOT NULL,               -- FK -> users(id)
    title      TEXT NOT NULL,
    visibility TEXT NOT NULL DEFAULT 'private',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    visible_at TEXT NOT NULL,

    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_chats_user_updated
    ON chats(user_id, updated_at DESC);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id           TEXT PRIMARY KEY NOT NULL, -- UUID
    chat_id      TEXT NOT NULL,             -- FK -> chats(id)
    user_id      TEXT NOT NULL,             -- chat owner at creation time
    role         TEXT NOT NULL,             -- user | assistant
    parts        TEXT NOT NULL,             -- JSON array of typed parts
    content      TEXT NOT NULL,             -- text parts joined, derived
    is_upvoted   INTEGER NOT NULL DEFAULT 0,
    is_downvoted INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL,

    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_created
    ON messages(chat_id, created_at ASC);
CREATE INDEX IF NOT EXISTS idx_messages_user ON messages(user_id);

-- ----------------------------------------------------------------
-- Quotas
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS user_messages_rate_limits (
    user_id          TEXT PRIMARY KEY NOT NULL,
    messages_counter INTEGER NOT NULL DEFAULT 0,
    tokens_counter   INTEGER NOT NULL DEFAULT 0,
    is_over_limit    INTEGER NOT NULL DEFAULT 0,
    period_start     TEXT,
    period_end       TEXT,
    updated_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_files_rate_limits (
    user_id       TEXT PRIMARY KEY NOT NULL,
    files_counter INTEGER NOT NULL DEFAULT 0,
    is_over_limit INTEGER NOT NULL DEFAULT 0,
    period_start  TEXT,
    period_end    TEXT,
    updated_at    TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Preferences
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS user_preferences (
    user_id     TEXT PRIMARY KEY NOT NULL,
    preferences TEXT NOT NULL,              -- JSON object
    updated_at  TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
