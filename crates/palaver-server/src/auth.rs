//! Identity resolution.
//!
//! The upstream identity provider authenticates the caller and forwards the
//! session as JSON in a header. Every authenticated request mirrors the
//! session's user into the `users` table so roles stay current.

use axum::http::HeaderMap;
use chrono::Utc;

use palaver_shared::session::{Session, SessionUser};
use palaver_store::{Database, User};

use crate::api::AppState;
use crate::error::ServerError;

/// Parse the session header. `Authentication` when it is absent.
pub fn session_from_headers(headers: &HeaderMap, header: &str) -> Result<Session, ServerError> {
    let raw = match headers.get(header) {
        Some(value) => Some(value.to_str().map_err(|_| {
            ServerError::SessionInvalid(vec!["session header is not valid UTF-8".to_string()])
        })?),
        None => None,
    };
    Ok(Session::from_raw(raw)?)
}

pub fn sync_user(db: &Database, user: &SessionUser) -> Result<(), ServerError> {
    db.upsert_user(&User {
        id: user.id,
        name: user.name.clone(),
        email: user.email.clone(),
        image: user.image.clone(),
        role: user.role,
        created_at: Utc::now(),
    })
    .map_err(ServerError::store("sync session user"))
}

/// Resolve the caller of a request.
pub async fn require_session(state: &AppState, headers: &HeaderMap) -> Result<SessionUser, ServerError> {
    let session = session_from_headers(headers, &state.config.session_header)?;
    sync_user(&*state.db.lock().await, &session.user)?;
    Ok(session.user)
}
