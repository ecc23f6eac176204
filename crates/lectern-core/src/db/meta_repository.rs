//! Key/value sync metadata: checkpoints, flags and the conflict clock

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::Checkpoint;

const CHECKPOINT_PREFIX: &str = "checkpoint:";
const LEGACY_IMPORT_KEY: &str = "legacy_import_complete";
const CONFLICT_CLOCK_KEY: &str = "conflict_clock";
const LAST_SYNC_KEY: &str = "last_sync_at";

/// `SQLite` access to the `sync_meta` table
pub struct SqliteMetaRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteMetaRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM sync_meta WHERE key = ?", params![key])?;
        Ok(())
    }

    pub fn checkpoint(&self, collection: &str) -> Result<Option<Checkpoint>> {
        let Some(raw) = self.get(&format!("{CHECKPOINT_PREFIX}{collection}"))? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.set(
            &format!("{CHECKPOINT_PREFIX}{}", checkpoint.collection),
            &serde_json::to_string(checkpoint)?,
        )
    }

    pub fn clear_checkpoint(&self, collection: &str) -> Result<()> {
        self.delete(&format!("{CHECKPOINT_PREFIX}{collection}"))
    }

    pub fn legacy_import_complete(&self) -> Result<bool> {
        Ok(self
            .get(LEGACY_IMPORT_KEY)?
            .is_some_and(|value| value == "true"))
    }

    pub fn mark_legacy_import_complete(&self) -> Result<()> {
        self.set(LEGACY_IMPORT_KEY, "true")
    }

    /// RFC 3339 time of the last completed pull cycle
    pub fn last_sync_at(&self) -> Result<Option<String>> {
        self.get(LAST_SYNC_KEY)
    }

    pub fn set_last_sync_at(&self, at: &str) -> Result<()> {
        self.set(LAST_SYNC_KEY, at)
    }

    /// Current conflict clock; pulls started at this value are fenced by it
    pub fn conflict_clock(&self) -> Result<i64> {
        Ok(self
            .get(CONFLICT_CLOCK_KEY)?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }

    /// Advance the conflict clock and return the new value
    pub fn tick_conflict_clock(&self) -> Result<i64> {
        let next = self.conflict_clock()? + 1;
        self.set(CONFLICT_CLOCK_KEY, &next.to_string())?;
        Ok(next)
    }
}
