//! CRUD operations for [`User`] records.

use rusqlite::{params, OptionalExtension};

use palaver_shared::UserId;

use crate::convert::{get_enum, get_id, get_ts, ts};
use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::User;

impl Database {
    /// Insert the user, or refresh the profile fields and role of an existing
    /// row. `created_at` is kept from the first insert.
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, name, email, image, role, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 name  = excluded.name,
                 email = excluded.email,
                 image = excluded.image,
                 role  = excluded.role",
            params![
                user.id.to_string(),
                user.name,
                user.email,
                user.image,
                user.role.as_str(),
                ts(&user.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, name, email, image, role, created_at
                 FROM users
                 WHERE id = ?1",
                params![id.to_string()],
                row_to_user,
            )
            .map_err(not_found)
    }

    /// Delete the user row. Returns the deleted id, or `None` when no such
    /// user existed.
    pub fn delete_user_row(&self, id: UserId) -> Result<Option<UserId>> {
        let deleted = self
            .conn()
            .query_row(
                "DELETE FROM users WHERE id = ?1 RETURNING id",
                params![id.to_string()],
                |row| get_id::<UserId>(row, 0),
            )
            .optional()?;
        Ok(deleted)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: get_id(row, 0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        image: row.get(3)?,
        role: get_enum(row, 4)?,
        created_at: get_ts(row, 5)?,
    })
}
