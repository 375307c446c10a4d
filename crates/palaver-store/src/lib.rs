//! # palaver-store
//!
//! SQLite persistence for Palaver. The crate exposes a synchronous
//! `Database` handle that wraps a `rusqlite::Connection` and provides typed
//! CRUD helpers for users, chats, messages, quota records and preferences.
//! Callers that share it across tasks put it behind a mutex.

pub mod chats;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod preferences;
pub mod quotas;
pub mod users;

mod convert;
mod error;

pub use convert::truncate_micros;
pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
