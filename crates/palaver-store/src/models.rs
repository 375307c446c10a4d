//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` so it can be handed directly to the HTTP
//! layer; field names are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use palaver_shared::parts::MessagePart;
use palaver_shared::{ChatId, MessageId, MessageRole, Role, UserId, Visibility};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A user as last reported by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub name: Option<String>,
    pub email: Option<String>,
    pub image: Option<String>,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    /// Owner of the chat.
    pub user_id: UserId,
    pub title: String,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last time the visibility changed.
    pub visible_at: DateTime<Utc>,
}

impl Chat {
    /// A fresh private chat owned by `user_id`.
    pub fn new(id: ChatId, user_id: UserId, title: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id,
            title,
            visibility: Visibility::Private,
            created_at: now,
            updated_at: now,
            visible_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A stored chat message. `content` is always the join of the text parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub role: MessageRole,
    pub parts: Vec<MessagePart>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_upvoted: bool,
    pub is_downvoted: bool,
}

/// A message as submitted by a caller, before it is stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub id: MessageId,
    pub role: MessageRole,
    pub parts: Vec<MessagePart>,
    /// Embedded timestamp; the insert time is used when absent.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Quotas
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuota {
    pub user_id: UserId,
    pub messages_counter: i64,
    pub tokens_counter: i64,
    pub is_over_limit: bool,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FilesQuota {
    pub user_id: UserId,
    pub files_counter: i64,
    pub is_over_limit: bool,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Preferences
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserPreferences {
    pub user_id: UserId,
    pub preferences: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}
