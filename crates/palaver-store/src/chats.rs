//! CRUD operations for [`Chat`] records.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use palaver_shared::{ChatId, UserId, Visibility};

use crate::convert::{get_enum, get_id, get_ts, ts};
use crate::database::Database;
use crate::error::{not_found, Result};
use crate::messages::insert_message_on;
use crate::models::{Chat, ChatMessage, NewMessage};

const CHAT_COLUMNS: &str = "id, user_id, title, visibility, created_at, updated_at, visible_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    pub fn create_chat(&self, chat: &Chat) -> Result<()> {
        insert_chat_on(self.conn(), chat)
    }

    /// Create `chat` together with its initial messages in one transaction.
    pub fn create_chat_with_messages(
        &self,
        chat: &Chat,
        messages: &[NewMessage],
    ) -> Result<Vec<ChatMessage>> {
        self.atomically(|db| {
            insert_chat_on(db.conn(), chat)?;
            messages
                .iter()
                .map(|m| insert_message_on(db.conn(), chat.id, chat.user_id, m))
                .collect()
        })
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_chat(&self, id: ChatId) -> Result<Chat> {
        self.conn()
            .query_row(
                &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
                params![id.to_string()],
                row_to_chat,
            )
            .map_err(not_found)
    }

    /// Look up a chat for an access decision. Rows whose visibility is not
    /// one of the known values are treated as absent.
    pub fn find_chat_for_access(&self, id: ChatId) -> Result<Option<Chat>> {
        let chat = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {CHAT_COLUMNS} FROM chats
                     WHERE id = ?1 AND visibility IN ('public', 'private')"
                ),
                params![id.to_string()],
                row_to_chat,
            )
            .optional()?;
        Ok(chat)
    }

    /// Chats owned by `user_id`, most recently updated first.
    pub fn list_chats_for_user(&self, user_id: UserId, limit: u32, offset: u32) -> Result<Vec<Chat>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats
             WHERE user_id = ?1
             ORDER BY updated_at DESC
             LIMIT ?2 OFFSET ?3"
        ))?;

        let rows = stmt.query_map(params![user_id.to_string(), limit, offset], row_to_chat)?;

        let mut chats = Vec::new();
        for row in rows {
            chats.push(row?);
        }
        Ok(chats)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Change visibility of a chat owned by `user_id`. Returns `false` when
    /// no such chat exists for that owner.
    pub fn set_chat_visibility(
        &self,
        id: ChatId,
        user_id: UserId,
        visibility: Visibility,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE chats
             SET visibility = ?1, visible_at = ?2, updated_at = ?2
             WHERE id = ?3 AND user_id = ?4",
            params![
                visibility.as_str(),
                ts(&now),
                id.to_string(),
                user_id.to_string()
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn touch_chat(&self, id: ChatId, now: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE chats SET updated_at = ?1 WHERE id = ?2",
            params![ts(&now), id.to_string()],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a chat owned by `user_id`. Returns `true` if a row was deleted.
    pub fn delete_chat(&self, id: ChatId, user_id: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM chats WHERE id = ?1 AND user_id = ?2",
            params![id.to_string(), user_id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Delete every chat owned by `user_id`. Returns the number removed.
    pub fn delete_chats_for_user(&self, user_id: UserId) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM chats WHERE user_id = ?1",
            params![user_id.to_string()],
        )?;
        Ok(affected)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn insert_chat_on(conn: &rusqlite::Connection, chat: &Chat) -> Result<()> {
    conn.execute(
        "INSERT INTO chats (id, user_id, title, visibility, created_at, updated_at, visible_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            chat.id.to_string(),
            chat.user_id.to_string(),
            chat.title,
            chat.visibility.as_str(),
            ts(&chat.created_at),
            ts(&chat.updated_at),
            ts(&chat.visible_at),
        ],
    )?;
    Ok(())
}

/// Map a `rusqlite::Row` selected with [`CHAT_COLUMNS`] to a [`Chat`].
fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: get_id(row, 0)?,
        user_id: get_id(row, 1)?,
        title: row.get(2)?,
        visibility: get_enum(row, 3)?,
        created_at: get_ts(row, 4)?,
        updated_at: get_ts(row, 5)?,
        visible_at: get_ts(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::truncate_micros;
    use crate::test_support::seed_user;
    use chrono::Duration;

    #[test]
    fn create_and_get() {
        let db = Database::open_in_memory().unwrap();
        let owner = seed_user(&db);
        let chat = Chat::new(ChatId::new(), owner, "hello".into(), truncate_micros(Utc::now()));
        db.create_chat(&chat).unwrap();

        assert_eq!(db.get_chat(chat.id).unwrap(), chat);
        assert!(db.get_chat(ChatId::new()).unwrap_err().is_not_found());
    }

    #[test]
    fn unknown_visibility_is_invisible_to_access_lookup() {
        let db = Database::open_in_memory().unwrap();
        let owner = seed_user(&db);
        let chat = Chat::new(ChatId::new(), owner, "t".into(), Utc::now());
        db.create_chat(&chat).unwrap();
        assert!(db.find_chat_for_access(chat.id).unwrap().is_some());

        db.conn()
            .execute(
                "UPDATE chats SET visibility = 'unlisted' WHERE id = ?1",
                params![chat.id.to_string()],
            )
            .unwrap();
        assert!(db.find_chat_for_access(chat.id).unwrap().is_none());
    }

    #[test]
    fn visibility_change_is_owner_scoped() {
        let db = Database::open_in_memory().unwrap();
        let owner = seed_user(&db);
        let other = seed_user(&db);
        let created = truncate_micros(Utc::now());
        let chat = Chat::new(ChatId::new(), owner, "t".into(), created);
        db.create_chat(&chat).unwrap();

        let later = created + Duration::minutes(5);
        assert!(!db.set_chat_visibility(chat.id, other, Visibility::Public, later).unwrap());
        assert!(db.set_chat_visibility(chat.id, owner, Visibility::Public, later).unwrap());

        let stored = db.get_chat(chat.id).unwrap();
        assert_eq!(stored.visibility, Visibility::Public);
        assert_eq!(stored.visible_at, later);
        assert_eq!(stored.created_at, created);
    }

    #[test]
    fn list_orders_by_recent_activity() {
        let db = Database::open_in_memory().unwrap();
        let owner = seed_user(&db);
        let now = truncate_micros(Utc::now());
        let older = Chat::new(ChatId::new(), owner, "older".into(), now - Duration::hours(2));
        let newer = Chat::new(ChatId::new(), owner, "newer".into(), now - Duration::hours(1));
        db.create_chat(&older).unwrap();
        db.create_chat(&newer).unwrap();

        let listed = db.list_chats_for_user(owner, 10, 0).unwrap();
        assert_eq!(listed[0].id, newer.id);

        db.touch_chat(older.id, now).unwrap();
        let listed = db.list_chats_for_user(owner, 10, 0).unwrap();
        assert_eq!(listed[0].id, older.id);
        assert_eq!(db.list_chats_for_user(owner, 1, 1).unwrap().len(), 1);
    }

    #[test]
    fn delete_for_user_leaves_others() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_user(&db);
        let b = seed_user(&db);
        db.create_chat(&Chat::new(ChatId::new(), a, "a1".into(), Utc::now())).unwrap();
        db.create_chat(&Chat::new(ChatId::new(), a, "a2".into(), Utc::now())).unwrap();
        db.create_chat(&Chat::new(ChatId::new(), b, "b1".into(), Utc::now())).unwrap();

        assert_eq!(db.delete_chats_for_user(a).unwrap(), 2);
        assert!(db.list_chats_for_user(a, 10, 0).unwrap().is_empty());
        assert_eq!(db.list_chats_for_user(b, 10, 0).unwrap().len(), 1);
    }
}
