//! Storage operations on top of the blob store: recursive folder deletion,
//! file duplication, uploads, and chat branching (which duplicates every
//! managed file a copied message points at).

use bytes::Bytes;
use chrono::Utc;
use futures::future::{try_join_all, BoxFuture, FutureExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use palaver_shared::constants::PUBLIC_OBJECT_PREFIX;
use palaver_shared::paths::{file_path, scope_dir};
use palaver_shared::session::SessionUser;
use palaver_shared::{Bucket, ChatId, FileId, MessageId, UserId};
use palaver_store::{Chat, Database, NewMessage};

use crate::access::get_chat_access;
use crate::blob_store::BlobStore;
use crate::error::ServerError;
use crate::messages::get_messages;
use crate::quota::{check_files_rate_limit, LimitReason};

/// A file stored on behalf of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub id: FileId,
    pub url: String,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Deletion
// ---------------------------------------------------------------------------

/// Delete everything stored for a user, or for one of their chats.
/// Returns how many objects were removed. A folder that does not exist is
/// not an error.
pub async fn delete_directory(
    store: &BlobStore,
    bucket: Bucket,
    user_id: UserId,
    chat_id: Option<ChatId>,
) -> Result<usize, ServerError> {
    let dir = scope_dir(&user_id, chat_id.as_ref());
    let removed = delete_tree(store, bucket, dir).await?;
    if removed > 0 {
        info!(%bucket, user = %user_id, chat = ?chat_id, count = removed, "Deleted stored files");
    }
    Ok(removed)
}

fn delete_tree(store: &BlobStore, bucket: Bucket, dir: String) -> BoxFuture<'_, Result<usize, ServerError>> {
    async move {
        let entries = store.list(bucket, &dir).await?;
        let (files, folders): (Vec<_>, Vec<_>) = entries.into_iter().partition(|e| !e.is_folder());

        let keys: Vec<String> = files.iter().map(|f| format!("{dir}/{}", f.name)).collect();
        let mut removed = if keys.is_empty() {
            0
        } else {
            store.remove(bucket, &keys).await?
        };

        let nested = try_join_all(
            folders
                .into_iter()
                .map(|folder| delete_tree(store, bucket, format!("{dir}/{}", folder.name))),
        )
        .await?;
        removed += nested.into_iter().sum::<usize>();

        Ok(removed)
    }
    .boxed()
}

/// Purge a user's (or one chat's) folder in every bucket concurrently.
pub async fn delete_all_buckets(
    store: &BlobStore,
    user_id: UserId,
    chat_id: Option<ChatId>,
) -> Result<usize, ServerError> {
    let removed = try_join_all(
        Bucket::ALL
            .into_iter()
            .map(|bucket| delete_directory(store, bucket, user_id, chat_id)),
    )
    .await?;
    Ok(removed.into_iter().sum())
}

// ---------------------------------------------------------------------------
// Duplication
// ---------------------------------------------------------------------------

/// Bucket-relative key of a public object URL.
///
/// `InvalidUrl` when the URL is not served from `base`, `Extraction` when it
/// does not point into `bucket`.
pub fn object_key<'a>(base: &str, url: &'a str, bucket: Bucket) -> Result<&'a str, ServerError> {
    let rest = url
        .strip_prefix(base)
        .filter(|rest| rest.starts_with('/'))
        .ok_or_else(|| ServerError::InvalidUrl(url.to_string()))?;

    let marker = format!("{PUBLIC_OBJECT_PREFIX}/{bucket}/");
    let key = rest
        .strip_prefix(marker.as_str())
        .and_then(|key| key.split(['?', '#']).next())
        .filter(|key| !key.is_empty())
        .ok_or_else(|| ServerError::Extraction(url.to_string()))?;
    Ok(key)
}

/// Which bucket a URL points into, if it is one of ours.
pub fn managed_bucket(store: &BlobStore, url: &str) -> Option<Bucket> {
    Bucket::ALL
        .into_iter()
        .find(|bucket| object_key(store.public_base(), url, *bucket).is_ok())
}

/// Copy a stored file into a fresh path owned by `(user, chat)`.
pub async fn duplicate_file(
    store: &BlobStore,
    source_url: &str,
    name: &str,
    chat_id: ChatId,
    user_id: UserId,
    bucket: Bucket,
) -> Result<StoredFile, ServerError> {
    let source = object_key(store.public_base(), source_url, bucket)?;
    let id = FileId::new();
    let target = file_path(&user_id, &chat_id, &id, name)?;

    store.copy(bucket, source, &target).await?;
    debug!(%bucket, from = source, to = %target, "Duplicated file");

    Ok(StoredFile {
        id,
        url: store.public_url(bucket, &target),
        name: name.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

pub struct FileUpload {
    pub name: String,
    pub data: Bytes,
    pub content_type: String,
}

/// Store a user upload for a chat. The chat does not have to exist yet, but
/// if it does the caller must own it.
pub async fn upload_file(
    db: &Mutex<Database>,
    store: &BlobStore,
    user: &SessionUser,
    chat_id: ChatId,
    upload: FileUpload,
    max_size: usize,
) -> Result<StoredFile, ServerError> {
    let FileUpload {
        name,
        data,
        content_type,
    } = upload;
    if data.is_empty() {
        return Err(ServerError::Validation("Empty file".to_string()));
    }
    if data.len() > max_size {
        return Err(ServerError::PayloadTooLarge {
            size: data.len(),
            max: max_size,
        });
    }

    {
        let db = db.lock().await;
        let access = get_chat_access(&db, chat_id, user.id)?;
        if access.chat_found && !access.is_owner {
            return Err(ServerError::AccessDenied(
                "Only the chat owner can upload files".to_string(),
            ));
        }

        let limit = check_files_rate_limit(&db, user.id, Some(user.role))?;
        if limit.is_over_limit {
            return Err(ServerError::RateLimited {
                reason: limit.reason.unwrap_or(LimitReason::Files),
                period_end: limit.period_end.unwrap_or_else(Utc::now),
            });
        }
    }

    let id = FileId::new();
    let key = file_path(&user.id, &chat_id, &id, &name)?;
    let size = data.len();
    store.upload(Bucket::UserFiles, &key, data, &content_type).await?;

    db.lock()
        .await
        .record_file_upload(user.id, Utc::now())
        .map_err(ServerError::store("record file upload"))?;

    info!(user = %user.id, chat = %chat_id, file = %id, size, "File uploaded");

    Ok(StoredFile {
        id,
        url: store.public_url(Bucket::UserFiles, &key),
        name,
    })
}

// ---------------------------------------------------------------------------
// Branching
// ---------------------------------------------------------------------------

/// Start a new private chat from a readable chat's history up to and
/// including `up_to`. Managed files are duplicated into the new chat so the
/// two chats never share blobs; external URLs are kept as they are.
pub async fn branch_chat(
    db: &Mutex<Database>,
    store: &BlobStore,
    user_id: UserId,
    source_chat: ChatId,
    up_to: MessageId,
) -> Result<Chat, ServerError> {
    let (title, mut history) = {
        let db = db.lock().await;
        let title = match db.get_chat(source_chat) {
            Ok(chat) => chat.title,
            Err(e) if e.is_not_found() => {
                return Err(ServerError::NotFound("Chat not found".to_string()))
            }
            Err(e) => return Err(ServerError::store("load source chat")(e)),
        };
        let history = get_messages(&db, source_chat, user_id, true)?;
        (title, history)
    };

    let cut = history
        .iter()
        .position(|m| m.id == up_to)
        .ok_or_else(|| ServerError::NotFound("Target message not found".to_string()))?;
    history.truncate(cut + 1);

    let new_chat = ChatId::new();
    let mut copies = Vec::with_capacity(history.len());
    for message in history {
        let mut parts = message.parts;
        for part in &mut parts {
            let Some(url) = part.blob_url() else { continue };
            let Some(bucket) = managed_bucket(store, url) else { continue };

            let key = object_key(store.public_base(), url, bucket)?;
            let name = key.rsplit('/').next().unwrap_or(key).to_string();
            let copied = match duplicate_file(store, url, &name, new_chat, user_id, bucket).await {
                Ok(copied) => copied,
                Err(e) => {
                    discard_branch_files(store, user_id, new_chat).await;
                    return Err(e);
                }
            };
            part.set_blob_url(copied.url);
        }

        copies.push(NewMessage {
            id: MessageId::new(),
            role: message.role,
            parts,
            created_at: Some(message.created_at),
        });
    }

    let chat = Chat::new(new_chat, user_id, title, Utc::now());
    let created = db.lock().await.create_chat_with_messages(&chat, &copies);
    if let Err(e) = created {
        discard_branch_files(store, user_id, new_chat).await;
        return Err(ServerError::store("create branched chat")(e));
    }

    info!(from = %source_chat, to = %new_chat, messages = copies.len(), "Branched chat");
    Ok(chat)
}

async fn discard_branch_files(store: &BlobStore, user_id: UserId, chat_id: ChatId) {
    if let Err(e) = delete_all_buckets(store, user_id, Some(chat_id)).await {
        warn!(chat = %chat_id, error = %e, "Failed to discard files of an aborted branch");
    }
}
