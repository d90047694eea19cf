use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use time::{OffsetDateTime, UtcOffset};

use crate::config::{ConfigPaths, StorageOptions};
use crate::journaling::{day, Entry};

mod schema;

/// Durable mirror of the single "today" entry.
pub trait LocalEntryStore: Send + 'static {
    fn load(&self) -> Result<Option<Entry>>;
    /// Last write wins; safe to call in quick succession.
    fn save(&self, entry: &Entry) -> Result<()>;
}

/// Archive that receives each finished day's entry.
pub trait LocalHistoryStore: Send + 'static {
    fn append(&self, entry: &Entry) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryRecord {
    /// Calendar day the entry belongs to (`YYYY-MM-DD` when the date parsed).
    pub day: String,
    pub entry: Entry,
    pub archived_at: i64,
}

#[derive(Clone)]
pub struct StorageHandle {
    db_path: Arc<PathBuf>,
    options: Arc<StorageOptions>,
}

impl StorageHandle {
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&*self.db_path)
            .with_context(|| format!("opening database {}", self.db_path.display()))?;
        prepare_connection(&conn, &self.options)?;
        Ok(conn)
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    pub fn load_today(&self) -> Result<Option<Entry>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT id, author, text, emotion_scale, date, ephemeral, saved
                 FROM today_entry
                 WHERE slot = 0",
                [],
                |row| {
                    Ok(Entry {
                        id: row.get(0)?,
                        author: row.get(1)?,
                        text: row.get(2)?,
                        emotion_scale: row.get(3)?,
                        date: row.get(4)?,
                        ephemeral: row.get::<_, i64>(5)? != 0,
                        saved: row.get::<_, i64>(6)? != 0,
                    })
                },
            )
            .optional()
            .context("reading cached today entry")
        })
    }

    pub fn save_today(&self, entry: &Entry) -> Result<()> {
        self.with_connection(|conn| {
            let now = OffsetDateTime::now_utc().unix_timestamp();
            conn.execute(
                "INSERT INTO today_entry
                    (slot, id, author, text, emotion_scale, date, ephemeral, saved, updated_at)
                 VALUES (0, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(slot) DO UPDATE SET
                    id = excluded.id,
                    author = excluded.author,
                    text = excluded.text,
                    emotion_scale = excluded.emotion_scale,
                    date = excluded.date,
                    ephemeral = excluded.ephemeral,
                    saved = excluded.saved,
                    updated_at = excluded.updated_at",
                params![
                    entry.id,
                    entry.author,
                    entry.text,
                    entry.emotion_scale,
                    entry.date,
                    i64::from(entry.ephemeral),
                    i64::from(entry.saved),
                    now
                ],
            )
            .context("writing cached today entry")?;
            Ok(())
        })
    }

    /// Upserts `entry` into the history, one row per calendar day. Ephemeral
    /// entries are never archived.
    pub fn archive_entry(&self, entry: &Entry) -> Result<bool> {
        if entry.ephemeral {
            tracing::debug!(date = %entry.date, "skipping archive of ephemeral entry");
            return Ok(false);
        }
        let day = day::parse_entry_date(&entry.date, UtcOffset::UTC)
            .map(day::stamp)
            .unwrap_or_else(|| entry.date.clone());
        self.with_connection(|conn| {
            let now = OffsetDateTime::now_utc().unix_timestamp();
            conn.execute(
                "INSERT INTO entries
                    (day, id, author, text, emotion_scale, date, saved, archived_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(day) DO UPDATE SET
                    id = excluded.id,
                    author = excluded.author,
                    text = excluded.text,
                    emotion_scale = excluded.emotion_scale,
                    date = excluded.date,
                    saved = excluded.saved,
                    archived_at = excluded.archived_at",
                params![
                    day,
                    entry.id,
                    entry.author,
                    entry.text,
                    entry.emotion_scale,
                    entry.date,
                    i64::from(entry.saved),
                    now
                ],
            )
            .with_context(|| format!("archiving entry for {day}"))?;
            Ok(true)
        })
    }

    /// Archived days, newest first.
    pub fn fetch_history(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT day, id, author, text, emotion_scale, date, saved, archived_at
                 FROM entries
                 ORDER BY day DESC
                 LIMIT ?1",
            )?;
            let records = stmt
                .query_map([limit as i64], history_from_row)?
                .collect::<Result<Vec<_>, _>>()
                .context("querying entry history")?;
            Ok(records)
        })
    }
}

impl LocalEntryStore for StorageHandle {
    fn load(&self) -> Result<Option<Entry>> {
        self.load_today()
    }

    fn save(&self, entry: &Entry) -> Result<()> {
        self.save_today(entry)
    }
}

impl LocalHistoryStore for StorageHandle {
    fn append(&self, entry: &Entry) -> Result<()> {
        self.archive_entry(entry).map(|_| ())
    }
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    Ok(HistoryRecord {
        day: row.get(0)?,
        entry: Entry {
            id: row.get(1)?,
            author: row.get(2)?,
            text: row.get(3)?,
            emotion_scale: row.get(4)?,
            date: row.get(5)?,
            ephemeral: false,
            saved: row.get::<_, i64>(6)? != 0,
        },
        archived_at: row.get(7)?,
    })
}

pub fn init(paths: &ConfigPaths, storage: &StorageOptions) -> Result<StorageHandle> {
    let db_path = if storage.database_path.as_os_str().is_empty() {
        &paths.database_path
    } else {
        &storage.database_path
    };
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    prepare_connection(&conn, storage)?;
    schema::apply(&conn)?;
    Ok(StorageHandle {
        db_path: Arc::new(db_path.clone()),
        options: Arc::new(storage.clone()),
    })
}

fn prepare_connection(conn: &Connection, storage: &StorageOptions) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("setting journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("setting synchronous=NORMAL")?;
    conn.pragma_update(
        None,
        "wal_autocheckpoint",
        storage.wal_autocheckpoint.to_string(),
    )
    .context("setting wal_autocheckpoint")?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use tempfile::TempDir;

    use super::*;

    pub(crate) fn temp_paths(root: &TempDir) -> ConfigPaths {
        let base = root.path();
        let config_dir = base.join("config");
        let data_dir = base.join("data");
        ConfigPaths {
            config_dir: config_dir.clone(),
            config_file: config_dir.join("config.toml"),
            data_dir: data_dir.clone(),
            database_path: data_dir.join("journal.db"),
        }
    }

    pub(crate) fn init_storage() -> anyhow::Result<(TempDir, StorageHandle)> {
        let temp = TempDir::new()?;
        let paths = temp_paths(&temp);
        paths.ensure_directories()?;
        let storage = init(&paths, &StorageOptions::default())?;
        Ok((temp, storage))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::init_storage;
    use super::*;
    use time::macros::date;

    fn entry(date: &str, text: &str, rating: u8) -> Entry {
        let mut entry = Entry::blank(date!(2024 - 04 - 03));
        entry.date = date.into();
        entry.text = Some(text.into());
        entry.emotion_scale = rating;
        entry
    }

    #[test]
    fn fresh_database_has_no_today_entry() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        assert_eq!(storage.load()?, None);
        assert!(storage.fetch_history(10)?.is_empty());
        Ok(())
    }

    #[test]
    fn today_slot_keeps_the_last_write() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        for i in 0..10u8 {
            storage.save(&entry("2024-04-03", &format!("draft {i}"), i))?;
        }
        let mut last = entry("2024-04-03", "final", 8);
        last.id = "e-42".into();
        last.author = "u-1".into();
        last.ephemeral = true;
        last.saved = true;
        storage.save(&last)?;

        assert_eq!(storage.load()?, Some(last));
        Ok(())
    }

    #[test]
    fn history_is_one_row_per_day_newest_first() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        storage.append(&entry("2024-04-01", "first", 4))?;
        storage.append(&entry("4/3/2024", "third", 6))?;
        storage.append(&entry("2024-04-02", "second", 5))?;
        storage.append(&entry("2024-04-01", "first, revised", 3))?;

        let history = storage.fetch_history(10)?;
        let days: Vec<&str> = history.iter().map(|record| record.day.as_str()).collect();
        assert_eq!(days, vec!["2024-04-03", "2024-04-02", "2024-04-01"]);
        assert_eq!(history[2].entry.text(), "first, revised");
        assert_eq!(history[2].entry.emotion_scale, 3);
        assert_eq!(history[0].entry.date, "4/3/2024");

        assert_eq!(storage.fetch_history(1)?.len(), 1);
        Ok(())
    }

    #[test]
    fn ephemeral_entries_are_not_archived() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        let mut gone = entry("2024-04-03", "delete me", 2);
        gone.ephemeral = true;
        assert!(!storage.archive_entry(&gone)?);
        assert!(storage.fetch_history(10)?.is_empty());
        Ok(())
    }
}
