//! Persistence for the per-user quota records.
//!
//! These helpers only read and write rows; the window state machine lives in
//! the server's quota ledger. Counter increments are single upsert
//! statements so concurrent writers never lose an update.

use chrono::{DateTime, Utc};
use rusqlite::params;

use palaver_shared::UserId;

use crate::convert::{get_id, get_opt_ts, get_ts, opt_ts, ts};
use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::{FilesQuota, MessagesQuota};

impl Database {
    // ------------------------------------------------------------------
    // Messages / tokens
    // ------------------------------------------------------------------

    /// Fetch the messages quota record, creating a zeroed one if absent.
    /// Creation is `ON CONFLICT DO NOTHING`, so racing callers end up with a
    /// single row.
    pub fn ensure_messages_quota(&self, user_id: UserId, now: DateTime<Utc>) -> Result<MessagesQuota> {
        self.conn().execute(
            "INSERT INTO user_messages_rate_limits (user_id, updated_at)
             VALUES (?1, ?2)
             ON CONFLICT(user_id) DO NOTHING",
            params![user_id.to_string(), ts(&now)],
        )?;
        self.get_messages_quota(user_id)
    }

    pub fn get_messages_quota(&self, user_id: UserId) -> Result<MessagesQuota> {
        self.conn()
            .query_row(
                "SELECT user_id, messages_counter, tokens_counter, is_over_limit,
                        period_start, period_end, updated_at
                 FROM user_messages_rate_limits
                 WHERE user_id = ?1",
                params![user_id.to_string()],
                row_to_messages_quota,
            )
            .map_err(not_found)
    }

    /// Zero the counters, clear the over-limit flag and period bounds.
    pub fn reset_messages_quota(&self, user_id: UserId, now: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE user_messages_rate_limits
             SET messages_counter = 0, tokens_counter = 0, is_over_limit = 0,
                 period_start = NULL, period_end = NULL, updated_at = ?1
             WHERE user_id = ?2",
            params![ts(&now), user_id.to_string()],
        )?;
        Ok(())
    }

    pub fn mark_messages_over_limit(
        &self,
        user_id: UserId,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE user_messages_rate_limits
             SET is_over_limit = 1, period_start = ?1, period_end = ?2, updated_at = ?1
             WHERE user_id = ?3",
            params![ts(&period_start), ts(&period_end), user_id.to_string()],
        )?;
        Ok(())
    }

    /// Add usage to the counters, creating the record if needed. Negative
    /// deltas count as zero and the counters saturate at `i64::MAX`.
    pub fn record_message_usage(
        &self,
        user_id: UserId,
        messages: i64,
        tokens: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO user_messages_rate_limits
                 (user_id, messages_counter, tokens_counter, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                 messages_counter = CASE
                     WHEN messages_counter > 9223372036854775807 - excluded.messages_counter
                     THEN 9223372036854775807
                     ELSE messages_counter + excluded.messages_counter END,
                 tokens_counter = CASE
                     WHEN tokens_counter > 9223372036854775807 - excluded.tokens_counter
                     THEN 9223372036854775807
                     ELSE tokens_counter + excluded.tokens_counter END,
                 updated_at = excluded.updated_at",
            params![user_id.to_string(), messages.max(0), tokens.max(0), ts(&now)],
        )?;
        Ok(())
    }

    pub fn delete_messages_quota(&self, user_id: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM user_messages_rate_limits WHERE user_id = ?1",
            params![user_id.to_string()],
        )?;
        Ok(affected > 0)
    }


    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    pub fn ensure_files_quota(&self, user_id: UserId, now: DateTime<Utc>) -> Result<FilesQuota> {
        self.conn().execute(
            "INSERT INTO user_files_rate_limits (user_id, updated_at)
             VALUES (?1, ?2)
             ON CONFLICT(user_id) DO NOTHING",
            params![user_id.to_string(), ts(&now)],
        )?;
        self.get_files_quota(user_id)
    }

    pub fn get_files_quota(&self, user_id: UserId) -> Result<FilesQuota> {
        self.conn()
            .query_row(
                "SELECT user_id, files_counter, is_over_limit, period_start, period_end, updated_at
                 FROM user_files_rate_limits
                 WHERE user_id = ?1",
                params![user_id.to_string()],
                row_to_files_quota,
            )
            .map_err(not_found)
    }

    pub fn reset_files_quota(&self, user_id: UserId, now: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE user_files_rate_limits
             SET files_counter = 0, is_over_limit = 0,
                 period_start = NULL, period_end = NULL, updated_at = ?1
             WHERE user_id = ?2",
            params![ts(&now), user_id.to_string()],
        )?;
        Ok(())
    }

    pub fn mark_files_over_limit(
        &self,
        user_id: UserId,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE user_files_rate_limits
             SET is_over_limit = 1, period_start = ?1, period_end = ?2, updated_at = ?1
             WHERE user_id = ?3",
            params![ts(&period_start), ts(&period_end), user_id.to_string()],
        )?;
        Ok(())
    }

    pub fn record_file_upload(&self, user_id: UserId, now: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO user_files_rate_limits (user_id, files_counter, updated_at)
             VALUES (?1, 1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET
                 files_counter = files_counter + 1,
                 updated_at    = excluded.updated_at",
            params![user_id.to_string(), ts(&now)],
        )?;
        Ok(())
    }

    pub fn delete_files_quota(&self, user_id: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM user_files_rate_limits WHERE user_id = ?1",
            params![user_id.to_string()],
        )?;
        Ok(affected > 0)
    }

}

fn row_to_messages_quota(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessagesQuota> {
    let is_over_limit: i32 = row.get(3)?;
    Ok(MessagesQuota {
        user_id: get_id(row, 0)?,
        messages_counter: row.get(1)?,
        tokens_counter: row.get(2)?,
        is_over_limit: is_over_limit != 0,
        period_start: get_opt_ts(row, 4)?,
        period_end: get_opt_ts(row, 5)?,
        updated_at: get_ts(row, 6)?,
    })
}

fn row_to_files_quota(row: &rusqlite::Row<'_>) -> rusqlite::Result<FilesQuota> {
    let is_over_limit: i32 = row.get(2)?;
    Ok(FilesQuota {
        user_id: get_id(row, 0)?,
        files_counter: row.get(1)?,
        is_over_limit: is_over_limit != 0,
        period_start: get_opt_ts(row, 3)?,
        period_end: get_opt_ts(row, 4)?,
        updated_at: get_ts(row, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::truncate_micros;
    use chrono::Duration;

    #[test]
    fn ensure_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let user = UserId::new();
        let now = truncate_micros(Utc::now());

        let first = db.ensure_messages_quota(user, now).unwrap();
        db.record_message_usage(user, 1, 10, now).unwrap();
        let second = db.ensure_messages_quota(user, now + Duration::hours(1)).unwrap();

        assert_eq!(first.messages_counter, 0);
        assert_eq!(second.messages_counter, 1);
        assert_eq!(second.tokens_counter, 10);

        let rows: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM user_messages_rate_limits", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn usage_creates_missing_record() {
        let db = Database::open_in_memory().unwrap();
        let user = UserId::new();
        db.record_message_usage(user, 1, 300, Utc::now()).unwrap();
        db.record_message_usage(user, 1, 200, Utc::now()).unwrap();

        let quota = db.get_messages_quota(user).unwrap();
        assert_eq!(quota.messages_counter, 2);
        assert_eq!(quota.tokens_counter, 500);
    }

    #[test]
    fn usage_saturates_instead_of_overflowing() {
        let db = Database::open_in_memory().unwrap();
        let user = UserId::new();
        db.record_message_usage(user, 0, i64::MAX, Utc::now()).unwrap();
        db.record_message_usage(user, 1, i64::MAX, Utc::now()).unwrap();
        db.record_message_usage(user, -5, -5, Utc::now()).unwrap();

        let quota = db.get_messages_quota(user).unwrap();
        assert_eq!(quota.tokens_counter, i64::MAX);
        assert_eq!(quota.messages_counter, 1);
    }

    #[test]
    fn over_limit_then_reset() {
        let db = Database::open_in_memory().unwrap();
        let user = UserId::new();
        let now = truncate_micros(Utc::now());
        db.record_message_usage(user, 5, 5, now).unwrap();

        db.mark_messages_over_limit(user, now, now + Duration::hours(24)).unwrap();
        let quota = db.get_messages_quota(user).unwrap();
        assert!(quota.is_over_limit);
        assert_eq!(quota.period_end, Some(now + Duration::hours(24)));

        db.reset_messages_quota(user, now).unwrap();
        let quota = db.get_messages_quota(user).unwrap();
        assert!(!quota.is_over_limit);
        assert_eq!(quota.messages_counter, 0);
        assert_eq!(quota.period_start, None);
    }

    #[test]
    fn files_quota_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let user = UserId::new();
        let now = truncate_micros(Utc::now());

        assert_eq!(db.ensure_files_quota(user, now).unwrap().files_counter, 0);
        db.record_file_upload(user, now).unwrap();
        db.record_file_upload(user, now).unwrap();
        assert_eq!(db.get_files_quota(user).unwrap().files_counter, 2);

        assert!(db.delete_files_quota(user).unwrap());
        assert!(db.get_files_quota(user).unwrap_err().is_not_found());
    }
}
