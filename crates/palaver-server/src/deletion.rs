//! Cascading deletion of chats and accounts.
//!
//! Rows go first, then storage. Storage is only touched after every row
//! deletion succeeded, so a failure never leaves rows pointing at files that
//! are already gone.

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use palaver_shared::{ChatId, UserId};
use palaver_store::{Database, StoreError};

use crate::access::require_owner;
use crate::blob_store::BlobStore;
use crate::error::ServerError;
use crate::storage::delete_all_buckets;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionSummary {
    pub messages: usize,
    pub chats: usize,
    pub files: usize,
}

fn step(name: &'static str) -> impl FnOnce(StoreError) -> ServerError {
    move |e| ServerError::DeletionFailed {
        step: name,
        message: e.to_string(),
    }
}

/// Delete every chat of a user along with its messages and stored files.
pub async fn delete_all_user_chats(
    db: &Mutex<Database>,
    store: &BlobStore,
    user_id: UserId,
) -> Result<DeletionSummary, ServerError> {
    let mut summary = {
        let db = db.lock().await;
        let messages = db
            .delete_messages_for_user(user_id)
            .map_err(step("delete messages"))?;
        let chats = db
            .delete_chats_for_user(user_id)
            .map_err(step("delete chats"))?;
        DeletionSummary {
            messages,
            chats,
            files: 0,
        }
    };

    summary.files = delete_all_buckets(store, user_id, None).await?;

    info!(
        user = %user_id,
        messages = summary.messages,
        chats = summary.chats,
        files = summary.files,
        "Deleted all chats"
    );
    Ok(summary)
}

/// Delete a user and every row that belongs to them. Runs in one
/// transaction. A missing user row is reported as `NotFound` after the
/// remaining rows keyed by that id have been removed.
pub fn delete_user(db: &Database, user_id: UserId) -> Result<DeletionSummary, ServerError> {
    let (summary, found) = db.atomically(|db| {
        let messages = db
            .delete_messages_for_user(user_id)
            .map_err(step("delete messages"))?;
        let chats = db
            .delete_chats_for_user(user_id)
            .map_err(step("delete chats"))?;
        db.delete_messages_quota(user_id)
            .map_err(step("delete messages rate limit"))?;
        db.delete_files_quota(user_id)
            .map_err(step("delete files rate limit"))?;
        db.delete_preferences(user_id)
            .map_err(step("delete preferences"))?;

        let deleted = db.delete_user_row(user_id).map_err(step("delete user"))?;
        let summary = DeletionSummary {
            messages,
            chats,
            files: 0,
        };
        Ok::<_, ServerError>((summary, deleted.is_some()))
    })?;

    if !found {
        return Err(ServerError::NotFound("User not found".to_string()));
    }
    Ok(summary)
}

/// Delete one chat the caller owns, then its stored files.
pub async fn delete_chat(
    db: &Mutex<Database>,
    store: &BlobStore,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<DeletionSummary, ServerError> {
    let mut summary = {
        let db = db.lock().await;
        require_owner(&db, chat_id, user_id)?;
        db.atomically(|db| {
            let messages = db
                .delete_messages_for_chat(chat_id)
                .map_err(step("delete chat messages"))?;
            let deleted = db.delete_chat(chat_id, user_id).map_err(step("delete chat"))?;
            Ok::<_, ServerError>(DeletionSummary {
                messages,
                chats: usize::from(deleted),
                files: 0,
            })
        })?
    };

    summary.files = delete_all_buckets(store, user_id, Some(chat_id)).await?;

    info!(chat = %chat_id, messages = summary.messages, files = summary.files, "Deleted chat");
    Ok(summary)
}

/// Delete the user and then everything they stored.
pub async fn delete_account(
    db: &Mutex<Database>,
    store: &BlobStore,
    user_id: UserId,
) -> Result<DeletionSummary, ServerError> {
    let mut summary = {
        let db = db.lock().await;
        delete_user(&db, user_id)?
    };

    summary.files = delete_all_buckets(store, user_id, None).await?;

    info!(user = %user_id, chats = summary.chats, files = summary.files, "Deleted account");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Utc;
    use palaver_shared::parts::MessagePart;
    use palaver_shared::paths::{file_path, scope_dir};
    use palaver_shared::{Bucket, FileId, MessageId, MessageRole};
    use palaver_store::NewMessage;
    use serde_json::json;
    use tempfile::TempDir;

    use crate::test_support::{seed_chat, seed_user};

    struct Fixture {
        db: Mutex<Database>,
        store: BlobStore,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path().to_path_buf(), "http://files.test")
            .await
            .unwrap();
        Fixture {
            db: Mutex::new(Database::open_in_memory().unwrap()),
            store,
            _dir: dir,
        }
    }

    async fn populate(fx: &Fixture, user: UserId) -> ChatId {
        let chat = {
            let db = fx.db.lock().await;
            let chat = seed_chat(&db, user);
            db.insert_message(
                chat,
                user,
                &NewMessage {
                    id: MessageId::new(),
                    role: MessageRole::User,
                    parts: vec![MessagePart::text("hello")],
                    created_at: None,
                },
            )
            .unwrap();
            chat
        };
        for bucket in Bucket::ALL {
            let key = file_path(&user, &chat, &FileId::new(), "f.bin").unwrap();
            fx.store
                .upload(bucket, &key, Bytes::from_static(b"x"), "application/octet-stream")
                .await
                .unwrap();
        }
        chat
    }

    async fn storage_entries(fx: &Fixture, user: UserId) -> usize {
        let mut total = 0;
        for bucket in Bucket::ALL {
            total += fx.store.list(bucket, &scope_dir(&user, None)).await.unwrap().len();
        }
        total
    }

    fn row_count(db: &Database, sql: &str, user: UserId) -> i64 {
        db.conn()
            .query_row(sql, [user.to_string()], |row| row.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn test_delete_all_user_chats_leaves_nothing() {
        let fx = fixture().await;
        let user = seed_user(&*fx.db.lock().await);
        populate(&fx, user).await;
        populate(&fx, user).await;

        let other = seed_user(&*fx.db.lock().await);
        populate(&fx, other).await;

        let summary = delete_all_user_chats(&fx.db, &fx.store, user).await.unwrap();
        assert_eq!(summary.chats, 2);
        assert_eq!(summary.messages, 2);
        assert_eq!(summary.files, 6);

        {
            let db = fx.db.lock().await;
            assert_eq!(row_count(&db, "SELECT COUNT(*) FROM messages WHERE user_id = ?1", user), 0);
            assert_eq!(row_count(&db, "SELECT COUNT(*) FROM chats WHERE user_id = ?1", user), 0);
            assert_eq!(row_count(&db, "SELECT COUNT(*) FROM chats WHERE user_id = ?1", other), 1);
        }
        assert_eq!(storage_entries(&fx, user).await, 0);
        assert_eq!(storage_entries(&fx, other).await, 3);
    }

    #[tokio::test]
    async fn test_delete_all_user_chats_without_data_is_ok() {
        let fx = fixture().await;
        let summary = delete_all_user_chats(&fx.db, &fx.store, UserId::new()).await.unwrap();
        assert_eq!(summary, DeletionSummary::default());
    }

    #[tokio::test]
    async fn test_delete_user_removes_every_row() {
        let fx = fixture().await;
        let user = seed_user(&*fx.db.lock().await);
        populate(&fx, user).await;
        {
            let db = fx.db.lock().await;
            db.record_message_usage(user, 1, 10, Utc::now()).unwrap();
            db.record_file_upload(user, Utc::now()).unwrap();
            db.upsert_preferences(user, &json!({"theme": "dark"}), Utc::now()).unwrap();

            delete_user(&db, user).unwrap();

            for table in [
                "SELECT COUNT(*) FROM messages WHERE user_id = ?1",
                "SELECT COUNT(*) FROM chats WHERE user_id = ?1",
                "SELECT COUNT(*) FROM user_messages_rate_limits WHERE user_id = ?1",
                "SELECT COUNT(*) FROM user_files_rate_limits WHERE user_id = ?1",
                "SELECT COUNT(*) FROM user_preferences WHERE user_id = ?1",
                "SELECT COUNT(*) FROM users WHERE id = ?1",
            ] {
                assert_eq!(row_count(&db, table, user), 0, "{table}");
            }
        }
    }

    #[tokio::test]
    async fn test_delete_unknown_user_is_not_found() {
        let fx = fixture().await;
        let db = fx.db.lock().await;
        let err = delete_user(&db, UserId::new()).unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_user_step_failure_rolls_back() {
        let fx = fixture().await;
        let user = seed_user(&*fx.db.lock().await);
        populate(&fx, user).await;

        let db = fx.db.lock().await;
        db.conn()
            .execute_batch("DROP TABLE user_files_rate_limits")
            .unwrap();

        match delete_user(&db, user).unwrap_err() {
            ServerError::DeletionFailed { step, .. } => assert_eq!(step, "delete files rate limit"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(row_count(&db, "SELECT COUNT(*) FROM chats WHERE user_id = ?1", user), 1);
        assert_eq!(row_count(&db, "SELECT COUNT(*) FROM messages WHERE user_id = ?1", user), 1);
        assert!(db.get_user(user).is_ok());
    }

    #[tokio::test]
    async fn test_delete_unknown_user_still_clears_orphan_rows() {
        let fx = fixture().await;
        let db = fx.db.lock().await;
        let ghost = UserId::new();
        db.record_message_usage(ghost, 1, 10, Utc::now()).unwrap();
        db.upsert_preferences(ghost, &json!({"theme": "dark"}), Utc::now()).unwrap();

        let err = delete_user(&db, ghost).unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
        assert_eq!(
            row_count(&db, "SELECT COUNT(*) FROM user_messages_rate_limits WHERE user_id = ?1", ghost),
            0
        );
        assert_eq!(
            row_count(&db, "SELECT COUNT(*) FROM user_preferences WHERE user_id = ?1", ghost),
            0
        );
    }

    #[tokio::test]
    async fn test_delete_chat_only_touches_that_chat() {
        let fx = fixture().await;
        let user = seed_user(&*fx.db.lock().await);
        let gone = populate(&fx, user).await;
        let kept = populate(&fx, user).await;

        let err = delete_chat(&fx.db, &fx.store, gone, UserId::new()).await.unwrap_err();
        assert!(matches!(err, ServerError::AccessDenied(_)));

        let summary = delete_chat(&fx.db, &fx.store, gone, user).await.unwrap();
        assert_eq!(summary.chats, 1);
        assert_eq!(summary.files, 3);

        let db = fx.db.lock().await;
        assert!(db.get_chat(gone).unwrap_err().is_not_found());
        assert!(db.get_chat(kept).is_ok());
        drop(db);
        assert_eq!(storage_entries(&fx, user).await, 3);
    }

    #[tokio::test]
    async fn test_delete_account_purges_storage() {
        let fx = fixture().await;
        let user = seed_user(&*fx.db.lock().await);
        populate(&fx, user).await;

        let summary = delete_account(&fx.db, &fx.store, user).await.unwrap();
        assert_eq!(summary.files, 3);
        assert_eq!(storage_entries(&fx, user).await, 0);
        assert!(fx.db.lock().await.get_user(user).unwrap_err().is_not_found());
    }
}
