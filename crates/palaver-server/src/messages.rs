//! Message lifecycle: store, rewrite, read, vote, and the send path that
//! ties messages to chat creation and quota accounting.

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};

use palaver_shared::constants::{MAX_CHAT_TITLE_CHARS, MAX_REPORTED_TOKENS};
use palaver_shared::parts::{title_from_parts, MessagePart};
use palaver_shared::session::SessionUser;
use palaver_shared::{ChatId, MessageId, MessageRole, UserId};
use palaver_store::{Chat, ChatMessage, Database, NewMessage};

use crate::access::{get_chat_access, require_owner, ChatAccess};
use crate::error::ServerError;
use crate::quota::check_rate_limit;

pub fn store_message(
    db: &Database,
    chat_id: ChatId,
    user_id: UserId,
    message: &NewMessage,
) -> Result<ChatMessage, ServerError> {
    let stored = db
        .insert_message(chat_id, user_id, message)
        .map_err(ServerError::store("store message"))?;
    debug!(chat = %chat_id, message = %stored.id, role = stored.role.as_str(), "Stored message");
    Ok(stored)
}

/// Replace a message's parts. `NotFound` when `(id, chat, user)` matches
/// nothing.
pub fn update_message(
    db: &Database,
    chat_id: ChatId,
    user_id: UserId,
    message_id: MessageId,
    parts: &[MessagePart],
) -> Result<ChatMessage, ServerError> {
    let updated = db
        .update_message_parts(chat_id, user_id, message_id, parts)
        .map_err(ServerError::store("update message"))?;
    if !updated {
        return Err(ServerError::NotFound("Message not found".to_string()));
    }
    db.get_message(chat_id, message_id)
        .map_err(ServerError::store("reload message"))
}

/// Delete a message and everything after it. Returns how many were removed.
pub fn delete_messages_from(
    db: &Database,
    chat_id: ChatId,
    user_id: UserId,
    message_id: MessageId,
) -> Result<usize, ServerError> {
    require_owner(db, chat_id, user_id)?;

    let deleted = db.delete_messages_from(chat_id, message_id).map_err(|e| {
        if e.is_not_found() {
            ServerError::NotFound("Target message not found".to_string())
        } else {
            ServerError::store("delete trailing messages")(e)
        }
    })?;

    info!(chat = %chat_id, from = %message_id, count = deleted, "Deleted trailing messages");
    Ok(deleted)
}

pub fn get_messages(
    db: &Database,
    chat_id: ChatId,
    user_id: UserId,
    verify_access: bool,
) -> Result<Vec<ChatMessage>, ServerError> {
    let access = get_chat_access(db, chat_id, user_id)?;
    read_messages(db, chat_id, &access, verify_access)
}

/// Read a chat's messages for a caller whose access was already resolved.
/// Vote flags are private to the owner.
pub fn read_messages(
    db: &Database,
    chat_id: ChatId,
    access: &ChatAccess,
    verify_access: bool,
) -> Result<Vec<ChatMessage>, ServerError> {
    if verify_access && !access.allowed {
        return Err(ServerError::AccessDenied(
            "You do not have access to this chat".to_string(),
        ));
    }

    let mut messages = db
        .get_messages_for_chat(chat_id)
        .map_err(ServerError::store("load messages"))?;

    if !access.is_owner {
        for message in &mut messages {
            message.is_upvoted = false;
            message.is_downvoted = false;
        }
    }
    Ok(messages)
}

// ---------------------------------------------------------------------------
// Send path
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessage {
    #[serde(flatten)]
    pub message: NewMessage,
    /// Model tokens consumed producing this message.
    #[serde(default)]
    pub tokens: i64,
}

/// Post a message to a chat, creating the chat on its first message.
///
/// User messages are refused while the caller is over quota. Usage is
/// recorded after the message is stored: one message per user message, plus
/// the reported tokens.
pub fn post_message(
    db: &Database,
    user: &SessionUser,
    chat_id: ChatId,
    post: PostMessage,
) -> Result<ChatMessage, ServerError> {
    if !(0..=MAX_REPORTED_TOKENS).contains(&post.tokens) {
        return Err(ServerError::Validation(format!(
            "tokens must be between 0 and {MAX_REPORTED_TOKENS}"
        )));
    }

    let existing = match db.get_chat(chat_id) {
        Ok(chat) => Some(chat),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(ServerError::store("load chat")(e)),
    };
    if let Some(chat) = &existing {
        if chat.user_id != user.id {
            return Err(ServerError::AccessDenied(
                "Only the chat owner can post messages".to_string(),
            ));
        }
    }

    if post.message.role == MessageRole::User {
        let limit = check_rate_limit(db, user.id, Some(user.role))?;
        if limit.is_over_limit {
            let reason = limit.reason.ok_or_else(|| {
                ServerError::InvariantViolation("over limit without a reason".to_string())
            })?;
            let period_end = limit.period_end.ok_or_else(|| {
                ServerError::InvariantViolation("over limit without a period end".to_string())
            })?;
            return Err(ServerError::RateLimited { reason, period_end });
        }
    }

    let now = Utc::now();
    let stored = match existing {
        Some(_) => {
            let stored = store_message(db, chat_id, user.id, &post.message)?;
            db.touch_chat(chat_id, now)
                .map_err(ServerError::store("touch chat"))?;
            stored
        }
        None => {
            let title = title_from_parts(&post.message.parts, MAX_CHAT_TITLE_CHARS);
            let chat = Chat::new(chat_id, user.id, title, now);
            let mut created = db
                .create_chat_with_messages(&chat, std::slice::from_ref(&post.message))
                .map_err(ServerError::store("create chat"))?;
            info!(chat = %chat_id, user = %user.id, "Created chat");
            created
                .pop()
                .ok_or_else(|| ServerError::InvariantViolation("chat created without its message".to_string()))?
        }
    };

    let messages = i64::from(stored.role == MessageRole::User);
    if messages > 0 || post.tokens > 0 {
        db.record_message_usage(user.id, messages, post.tokens, now)
            .map_err(ServerError::store("record message usage"))?;
    }

    Ok(stored)
}

// ---------------------------------------------------------------------------
// Votes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Up,
    Down,
    None,
}

pub fn set_message_vote(
    db: &Database,
    chat_id: ChatId,
    user_id: UserId,
    message_id: MessageId,
    vote: Vote,
) -> Result<(), ServerError> {
    require_owner(db, chat_id, user_id)?;

    let (up, down) = match vote {
        Vote::Up => (true, false),
        Vote::Down => (false, true),
        Vote::None => (false, false),
    };
    let updated = db
        .set_message_vote(chat_id, message_id, up, down)
        .map_err(ServerError::store("vote on message"))?;
    if !updated {
        return Err(ServerError::NotFound("Message not found".to_string()));
    }
    Ok(())
}
