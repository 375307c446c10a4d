//! Schema migrations.
//!
//! Each entry in [`MIGRATIONS`] runs once, guarded by `PRAGMA user_version`,
//! and in its own transaction so a failing step leaves the version untouched.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> std::result::Result<(), rusqlite::Error>;

/// Ordered list of `(version, name, step)`. Append new migrations here.
const MIGRATIONS: &[(u32, &str, Step)] = &[(1, "v001_initial", v001_initial::up)];

pub fn current_version() -> u32 {
    MIGRATIONS.last().map(|(v, _, _)| *v).unwrap_or(0)
}

/// Run all pending migrations against the open connection.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    tracing::info!(
        current_version = current,
        target_version = current_version(),
        "checking database migrations"
    );

    for (version, name, step) in MIGRATIONS.iter().filter(|(v, _, _)| *v > current) {
        tracing::info!(migration = name, "applying migration");

        let tx = conn.unchecked_transaction()?;
        step(&tx).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, current_version());
    }
}
