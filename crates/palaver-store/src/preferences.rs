//! Per-user preference storage.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use palaver_shared::UserId;

use crate::convert::{get_id, get_json, get_ts, ts};
use crate::database::Database;
use crate::error::Result;
use crate::models::UserPreferences;

impl Database {
    pub fn get_preferences(&self, user_id: UserId) -> Result<Option<UserPreferences>> {
        let record = self
            .conn()
            .query_row(
                "SELECT user_id, preferences, updated_at
                 FROM user_preferences
                 WHERE user_id = ?1",
                params![user_id.to_string()],
                |row| {
                    Ok(UserPreferences {
                        user_id: get_id(row, 0)?,
                        preferences: get_json(row, 1)?,
                        updated_at: get_ts(row, 2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Create or replace the preferences document.
    pub fn upsert_preferences(
        &self,
        user_id: UserId,
        preferences: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO user_preferences (user_id, preferences, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                 preferences = excluded.preferences,
                 updated_at  = excluded.updated_at",
            params![user_id.to_string(), serde_json::to_string(preferences)?, ts(&now)],
        )?;
        Ok(())
    }

    pub fn delete_preferences(&self, user_id: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM user_preferences WHERE user_id = ?1",
            params![user_id.to_string()],
        )?;
        Ok(affected > 0)
    }
}
