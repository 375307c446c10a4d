use chrono::Utc;
use rusqlite::{params, Connection};

use palaver_shared::parts::{derive_content, MessagePart};
use palaver_shared::{ChatId, MessageId, UserId};

use crate::convert::{get_enum, get_id, get_json, get_ts, truncate_micros, ts};
use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::{ChatMessage, NewMessage};

const MESSAGE_COLUMNS: &str =
    "id, chat_id, user_id, role, parts, content, created_at, is_upvoted, is_downvoted";

impl Database {
    /// Insert one message. `content` is derived from the text parts.
    pub fn insert_message(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        message: &NewMessage,
    ) -> Result<ChatMessage> {
        insert_message_on(self.conn(), chat_id, user_id, message)
    }

    /// Replace the parts of a message and re-derive its content in the same
    /// statement. Returns `false` when no row matched `(id, chat, user)`.
    pub fn update_message_parts(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        id: MessageId,
        parts: &[MessagePart],
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET parts = ?1, content = ?2
             WHERE id = ?3 AND chat_id = ?4 AND user_id = ?5",
            params![
                serde_json::to_string(parts)?,
                derive_content(parts),
                id.to_string(),
                chat_id.to_string(),
                user_id.to_string(),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn get_message(&self, chat_id: ChatId, id: MessageId) -> Result<ChatMessage> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1 AND chat_id = ?2"),
                params![id.to_string(), chat_id.to_string()],
                row_to_message,
            )
            .map_err(not_found)
    }

    /// All messages of a chat, oldest first.
    pub fn get_messages_for_chat(&self, chat_id: ChatId) -> Result<Vec<ChatMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE chat_id = ?1
             ORDER BY created_at ASC, rowid ASC"
        ))?;

        let rows = stmt.query_map(params![chat_id.to_string()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Delete the target message and every later message of the chat
    /// (`created_at >= target.created_at`). The lookup and the delete share
    /// one transaction.
    ///
    /// Returns [`StoreError::NotFound`](crate::StoreError::NotFound) when the
    /// target is not part of the chat.
    pub fn delete_messages_from(&self, chat_id: ChatId, id: MessageId) -> Result<usize> {
        self.atomically(|db| {
            let cut: String = db
                .conn()
                .query_row(
                    "SELECT created_at FROM messages WHERE id = ?1 AND chat_id = ?2",
                    params![id.to_string(), chat_id.to_string()],
                    |row| row.get(0),
                )
                .map_err(not_found)?;

            let affected = db.conn().execute(
                "DELETE FROM messages WHERE chat_id = ?1 AND created_at >= ?2",
                params![chat_id.to_string(), cut],
            )?;
            Ok(affected)
        })
    }

    pub fn set_message_vote(
        &self,
        chat_id: ChatId,
        id: MessageId,
        is_upvoted: bool,
        is_downvoted: bool,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET is_upvoted = ?1, is_downvoted = ?2
             WHERE id = ?3 AND chat_id = ?4",
            params![
                is_upvoted as i32,
                is_downvoted as i32,
                id.to_string(),
                chat_id.to_string()
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn delete_messages_for_chat(&self, chat_id: ChatId) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE chat_id = ?1",
            params![chat_id.to_string()],
        )?;
        Ok(affected)
    }

    pub fn delete_messages_for_user(&self, user_id: UserId) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE user_id = ?1",
            params![user_id.to_string()],
        )?;
        Ok(affected)
    }

    #[cfg(test)]
    pub fn count_messages_for_user(&self, user_id: UserId) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE user_id = ?1",
            params![user_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

pub(crate) fn insert_message_on(
    conn: &Connection,
    chat_id: ChatId,
    user_id: UserId,
    message: &NewMessage,
) -> Result<ChatMessage> {
    let created_at = truncate_micros(message.created_at.unwrap_or_else(Utc::now));
    let content = derive_content(&message.parts);

    conn.execute(
        "INSERT INTO messages (id, chat_id, user_id, role, parts, content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            message.id.to_string(),
            chat_id.to_string(),
            user_id.to_string(),
            message.role.as_str(),
            serde_json::to_string(&message.parts)?,
            content,
            ts(&created_at),
        ],
    )?;

    Ok(ChatMessage {
        id: message.id,
        chat_id,
        user_id,
        role: message.role,
        parts: message.parts.clone(),
        content,
        created_at,
        is_upvoted: false,
        is_downvoted: false,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let is_upvoted: i32 = row.get(7)?;
    let is_downvoted: i32 = row.get(8)?;

    Ok(ChatMessage {
        id: get_id(row, 0)?,
        chat_id: get_id(row, 1)?,
        user_id: get_id(row, 2)?,
        role: get_enum(row, 3)?,
        parts: get_json(row, 4)?,
        content: row.get(5)?,
        created_at: get_ts(row, 6)?,
        is_upvoted: is_upvoted != 0,
        is_downvoted: is_downvoted != 0,
    })
}
