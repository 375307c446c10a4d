//! Chat access resolution and caching.
//!
//! A chat is readable by its owner, and by anyone when it is public. The
//! decision is a pure function of the chat row and the caller, so the
//! owner/visibility pair of each chat is cached for a short TTL and
//! invalidated whenever the visibility changes or the chat goes away.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use palaver_shared::{ChatId, UserId, Visibility};
use palaver_store::{Chat, Database};

use crate::error::ServerError;

/// Outcome of an access check. `visibility` is absent when the chat was not
/// found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAccess {
    pub allowed: bool,
    pub chat_found: bool,
    pub is_owner: bool,
    pub is_private: bool,
    pub is_public: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
}

impl ChatAccess {
    fn not_found() -> Self {
        Self {
            allowed: false,
            chat_found: false,
            is_owner: false,
            is_private: false,
            is_public: false,
            visibility: None,
        }
    }
}

fn is_allowed(is_owner: bool, is_private: bool, is_public: bool) -> Result<bool, ServerError> {
    match (is_owner, is_private, is_public) {
        (true, _, _) => Ok(true),
        (false, true, false) => Ok(false),
        (false, false, true) => Ok(true),
        _ => Err(ServerError::InvariantViolation(format!(
            "unexpected chat visibility state (private={is_private}, public={is_public})"
        ))),
    }
}

/// Decide access from the chat's owner and visibility.
pub fn decide(
    chat: Option<(UserId, Visibility)>,
    user_id: UserId,
) -> Result<ChatAccess, ServerError> {
    let Some((owner, visibility)) = chat else {
        return Ok(ChatAccess::not_found());
    };

    let is_owner = owner == user_id;
    let is_private = visibility == Visibility::Private;
    let is_public = visibility == Visibility::Public;

    Ok(ChatAccess {
        allowed: is_allowed(is_owner, is_private, is_public)?,
        chat_found: true,
        is_owner,
        is_private,
        is_public,
        visibility: Some(visibility),
    })
}

pub fn get_chat_access(
    db: &Database,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<ChatAccess, ServerError> {
    let chat = db
        .find_chat_for_access(chat_id)
        .map_err(ServerError::store("load chat for access"))?;
    decide(chat.map(|c| (c.user_id, c.visibility)), user_id)
}

/// Load a chat the caller must own.
pub fn require_owner(db: &Database, chat_id: ChatId, user_id: UserId) -> Result<Chat, ServerError> {
    let chat = db.get_chat(chat_id).map_err(|e| {
        if e.is_not_found() {
            ServerError::NotFound("Chat not found".to_string())
        } else {
            ServerError::store("load chat")(e)
        }
    })?;

    if chat.user_id != user_id {
        return Err(ServerError::AccessDenied(
            "Only the chat owner can do this".to_string(),
        ));
    }
    Ok(chat)
}

pub fn set_chat_visibility(
    db: &Database,
    chat_id: ChatId,
    user_id: UserId,
    visibility: Visibility,
) -> Result<Chat, ServerError> {
    require_owner(db, chat_id, user_id)?;
    db.set_chat_visibility(chat_id, user_id, visibility, Utc::now())
        .map_err(ServerError::store("update chat visibility"))?;
    db.get_chat(chat_id)
        .map_err(ServerError::store("reload chat"))
}

pub fn list_chats(
    db: &Database,
    user_id: UserId,
    limit: u32,
    offset: u32,
) -> Result<Vec<Chat>, ServerError> {
    db.list_chats_for_user(user_id, limit, offset)
        .map_err(ServerError::store("list chats"))
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct CachedChat {
    owner: UserId,
    visibility: Visibility,
    cached_at: Instant,
}

/// Owner and visibility of recently checked chats. Chats that were not found
/// are never cached, since they may be created at any time.
#[derive(Clone)]
pub struct ChatAccessCache {
    state: Arc<RwLock<CacheState>>,
    ttl: Duration,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<ChatId, CachedChat>,
    /// Bumped by every invalidation. A lookup only caches its result when no
    /// invalidation happened between its database read and its insert.
    epoch: u64,
}

impl ChatAccessCache {
    /// A zero `ttl` disables caching.
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(CacheState::default())),
            ttl,
        }
    }

    pub async fn get_chat_access(
        &self,
        db: &Mutex<Database>,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<ChatAccess, ServerError> {
        let epoch = {
            let state = self.state.read().await;
            if let Some(entry) = state.entries.get(&chat_id) {
                if entry.cached_at.elapsed() < self.ttl {
                    debug!(chat = %chat_id, "Chat access served from cache");
                    return decide(Some((entry.owner, entry.visibility)), user_id);
                }
            }
            state.epoch
        };

        let chat = {
            let db = db.lock().await;
            db.find_chat_for_access(chat_id)
                .map_err(ServerError::store("load chat for access"))?
        };

        if let Some(chat) = &chat {
            self.remember(chat_id, chat.user_id, chat.visibility, epoch).await;
        }

        decide(chat.map(|c| (c.user_id, c.visibility)), user_id)
    }

    /// Cache a lookup made at `epoch`. Returns false when caching is disabled
    /// or an invalidation has happened since.
    async fn remember(&self, chat_id: ChatId, owner: UserId, visibility: Visibility, epoch: u64) -> bool {
        if self.ttl.is_zero() {
            return false;
        }
        let mut state = self.state.write().await;
        if state.epoch != epoch {
            debug!(chat = %chat_id, "Skipped caching chat access read before an invalidation");
            return false;
        }
        state.entries.insert(
            chat_id,
            CachedChat {
                owner,
                visibility,
                cached_at: Instant::now(),
            },
        );
        true
    }

    pub async fn invalidate(&self, chat_id: ChatId) {
        let mut state = self.state.write().await;
        state.epoch += 1;
        if state.entries.remove(&chat_id).is_some() {
            debug!(chat = %chat_id, "Invalidated chat access");
        }
    }

    /// Drop every entry for chats owned by `user_id`.
    pub async fn invalidate_user(&self, user_id: UserId) {
        let mut state = self.state.write().await;
        state.epoch += 1;
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.owner != user_id);
        debug!(user = %user_id, removed = before - state.entries.len(), "Invalidated user chat access");
    }

    pub async fn purge_expired(&self) {
        let mut state = self.state.write().await;
        let ttl = self.ttl;
        state.entries.retain(|_, entry| entry.cached_at.elapsed() < ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed_chat, seed_user};

    #[test]
    fn test_decision_table() {
        let owner = UserId::new();
        let other = UserId::new();

        let cases = [
            (owner, Visibility::Private, true),
            (owner, Visibility::Public, true),
            (other, Visibility::Private, false),
            (other, Visibility::Public, true),
        ];
        for (caller, visibility, allowed) in cases {
            let access = decide(Some((owner, visibility)), caller).unwrap();
            assert_eq!(access.allowed, allowed, "{caller} {visibility}");
            assert!(access.chat_found);
            assert_eq!(access.is_owner, caller == owner);
            assert_eq!(access.visibility, Some(visibility));
        }
    }

    #[test]
    fn test_not_found_has_no_visibility_key() {
        let access = decide(None, UserId::new()).unwrap();
        assert!(!access.allowed);
        assert!(!access.chat_found);
        assert!(!access.is_owner);

        let json = serde_json::to_value(&access).unwrap();
        assert!(json.get("visibility").is_none());
        assert_eq!(json["chatFound"], false);
    }

    #[test]
    fn test_impossible_visibility_is_invariant_violation() {
        for (private, public) in [(true, true), (false, false)] {
            let err = is_allowed(false, private, public).unwrap_err();
            assert!(matches!(err, ServerError::InvariantViolation(_)));
        }
        assert!(is_allowed(true, false, false).unwrap());
    }

    #[test]
    fn test_get_chat_access_against_store() {
        let db = Database::open_in_memory().unwrap();
        let owner = seed_user(&db);
        let chat = seed_chat(&db, owner);

        assert!(get_chat_access(&db, chat, owner).unwrap().is_owner);
        assert!(!get_chat_access(&db, chat, UserId::new()).unwrap().allowed);
        assert!(!get_chat_access(&db, ChatId::new(), owner).unwrap().chat_found);
    }

    #[test]
    fn test_only_owner_changes_visibility() {
        let db = Database::open_in_memory().unwrap();
        let owner = seed_user(&db);
        let chat = seed_chat(&db, owner);

        let err = set_chat_visibility(&db, chat, UserId::new(), Visibility::Public).unwrap_err();
        assert!(matches!(err, ServerError::AccessDenied(_)));

        let updated = set_chat_visibility(&db, chat, owner, Visibility::Public).unwrap();
        assert_eq!(updated.visibility, Visibility::Public);
        assert!(get_chat_access(&db, chat, UserId::new()).unwrap().allowed);
    }

    #[tokio::test]
    async fn test_cache_serves_stale_until_invalidated() {
        let db = Mutex::new(Database::open_in_memory().unwrap());
        let (owner, chat) = {
            let db = db.lock().await;
            let owner = seed_user(&db);
            (owner, seed_chat(&db, owner))
        };
        let stranger = UserId::new();
        let cache = ChatAccessCache::new(Duration::from_secs(60));

        assert!(!cache.get_chat_access(&db, chat, stranger).await.unwrap().allowed);

        db.lock()
            .await
            .set_chat_visibility(chat, owner, Visibility::Public, Utc::now())
            .unwrap();
        assert!(!cache.get_chat_access(&db, chat, stranger).await.unwrap().allowed);

        cache.invalidate(chat).await;
        assert!(cache.get_chat_access(&db, chat, stranger).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_cache_invalidate_user_and_zero_ttl() {
        let db = Mutex::new(Database::open_in_memory().unwrap());
        let (owner, chat) = {
            let db = db.lock().await;
            let owner = seed_user(&db);
            (owner, seed_chat(&db, owner))
        };

        let cache = ChatAccessCache::new(Duration::from_secs(60));
        cache.get_chat_access(&db, chat, owner).await.unwrap();
        assert_eq!(cache.state.read().await.entries.len(), 1);
        cache.invalidate_user(owner).await;
        assert!(cache.state.read().await.entries.is_empty());

        let disabled = ChatAccessCache::new(Duration::ZERO);
        disabled.get_chat_access(&db, chat, owner).await.unwrap();
        assert!(disabled.state.read().await.entries.is_empty());
    }

    #[tokio::test]
    async fn test_read_overtaken_by_invalidation_is_not_cached() {
        let cache = ChatAccessCache::new(Duration::from_secs(60));
        let chat = ChatId::new();
        let owner = UserId::new();

        // A lookup reads the chat as public, then the visibility changes and
        // is invalidated before the lookup stores its result.
        let epoch = cache.state.read().await.epoch;
        cache.invalidate(chat).await;
        assert!(!cache.remember(chat, owner, Visibility::Public, epoch).await);
        assert!(cache.state.read().await.entries.is_empty());

        let epoch = cache.state.read().await.epoch;
        cache.invalidate_user(UserId::new()).await;
        assert!(!cache.remember(chat, owner, Visibility::Public, epoch).await);

        let epoch = cache.state.read().await.epoch;
        assert!(cache.remember(chat, owner, Visibility::Private, epoch).await);
        assert_eq!(cache.state.read().await.entries.len(), 1);
    }
}
