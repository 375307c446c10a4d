//! # palaver-shared
//!
//! Types shared by the Palaver store and server: identifiers, roles and
//! visibility, typed message parts, per-role entitlements, hashed storage
//! paths and the session schema.

pub mod constants;
pub mod entitlements;
pub mod error;
pub mod parts;
pub mod paths;
pub mod session;
pub mod types;

pub use error::{SessionError, ValidationError};
pub use types::{Bucket, ChatId, FileId, MessageId, MessageRole, Role, UserId, Visibility};
