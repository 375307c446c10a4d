//! Storage path construction.
//!
//! User and chat ids never appear in storage paths directly. Each is replaced
//! by a BLAKE3 derive-key hash so paths cannot be enumerated from raw ids.

use crate::constants::KDF_CONTEXT_STORAGE_PATH;
use crate::error::ValidationError;
use crate::types::{ChatId, FileId, UserId};

pub fn hash_segment(id: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_STORAGE_PATH);
    hasher.update(id);
    hex::encode(hasher.finalize().as_bytes())
}

/// `<hash(user)>` or `<hash(user)>/<hash(chat)>`.
pub fn scope_dir(user_id: &UserId, chat_id: Option<&ChatId>) -> String {
    let user = hash_segment(user_id.as_bytes());
    match chat_id {
        Some(chat) => format!("{}/{}", user, hash_segment(chat.as_bytes())),
        None => user,
    }
}

/// `<hash(user)>/<hash(chat)>/<file id>/<name>`.
pub fn file_path(
    user_id: &UserId,
    chat_id: &ChatId,
    file_id: &FileId,
    name: &str,
) -> Result<String, ValidationError> {
    let name = sanitize_file_name(name)?;
    Ok(format!(
        "{}/{}/{}",
        scope_dir(user_id, Some(chat_id)),
        file_id,
        name
    ))
}

/// Keep a human file name usable as a single path segment.
pub fn sanitize_file_name(name: &str) -> Result<String, ValidationError> {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        return Err(ValidationError::InvalidFileName(name.to_string()));
    }
    Ok(cleaned)
}
