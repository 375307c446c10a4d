use chrono::{DateTime, SecondsFormat, Utc};

use palaver_shared::session::SessionUser;
use palaver_shared::{ChatId, Role, UserId};
use palaver_store::{Chat, Database, FilesQuota, MessagesQuota};

use crate::auth::sync_user;

pub fn session_user(db: &Database, role: Role) -> SessionUser {
    let user = SessionUser {
        id: UserId::new(),
        name: Some("Test User".to_string()),
        email: Some("test@example.com".to_string()),
        image: None,
        role,
    };
    sync_user(db, &user).unwrap();
    user
}

pub fn seed_user(db: &Database) -> UserId {
    session_user(db, Role::User).id
}

pub fn seed_chat(db: &Database, owner: UserId) -> ChatId {
    let chat = Chat::new(ChatId::new(), owner, "Test chat".to_string(), Utc::now());
    db.create_chat(&chat).unwrap();
    chat.id
}

fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Overwrite a messages quota record to seed a specific window state.
pub fn put_messages_quota(db: &Database, quota: &MessagesQuota) {
    db.conn()
        .execute(
            "INSERT OR REPLACE INTO user_messages_rate_limits
                 (user_id, messages_counter, tokens_counter, is_over_limit,
                  period_start, period_end, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            (
                quota.user_id.to_string(),
                quota.messages_counter,
                quota.tokens_counter,
                quota.is_over_limit as i32,
                quota.period_start.as_ref().map(ts),
                quota.period_end.as_ref().map(ts),
                ts(&quota.updated_at),
            ),
        )
        .unwrap();
}

pub fn put_files_quota(db: &Database, quota: &FilesQuota) {
    db.conn()
        .execute(
            "INSERT OR REPLACE INTO user_files_rate_limits
                 (user_id, files_counter, is_over_limit, period_start, period_end, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (
                quota.user_id.to_string(),
                quota.files_counter,
                quota.is_over_limit as i32,
                quota.period_start.as_ref().map(ts),
                quota.period_end.as_ref().map(ts),
                ts(&quota.updated_at),
            ),
        )
        .unwrap();
}
