use anyhow::{Context, Result};
use rusqlite::Connection;

pub fn apply(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS today_entry (
            slot INTEGER PRIMARY KEY CHECK (slot = 0),
            id TEXT NOT NULL DEFAULT '',
            author TEXT NOT NULL DEFAULT '',
            text TEXT,
            emotion_scale INTEGER NOT NULL CHECK (emotion_scale BETWEEN 0 AND 10),
            date TEXT NOT NULL,
            ephemeral INTEGER NOT NULL DEFAULT 0,
            saved INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entries (
            day TEXT PRIMARY KEY,
            id TEXT NOT NULL DEFAULT '',
            author TEXT NOT NULL DEFAULT '',
            text TEXT,
            emotion_scale INTEGER NOT NULL CHECK (emotion_scale BETWEEN 0 AND 10),
            date TEXT NOT NULL,
            saved INTEGER NOT NULL DEFAULT 0,
            archived_at INTEGER NOT NULL
        );
        "#,
    )
    .context("applying schema migrations")?;
    Ok(())
}
