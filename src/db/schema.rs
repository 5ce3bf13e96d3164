//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS turns (
            id TEXT PRIMARY KEY,
            backend TEXT NOT NULL,
            routed INTEGER NOT NULL DEFAULT 0,
            user_text TEXT NOT NULL,
            reply_text TEXT NOT NULL,
            iterations INTEGER NOT NULL,
            prompt_tokens INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_turns_created ON turns(created_at);

        PRAGMA user_version = 1;
        ",
    )?;

    Ok(())
}
