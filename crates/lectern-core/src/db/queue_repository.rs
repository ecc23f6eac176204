//! Change-queue repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use std::collections::HashSet;

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::models::{ChangeEntry, ChangeOp, Payload};

/// A change about to be enqueued.
#[derive(Debug, Clone, Copy)]
pub struct NewChange<'a> {
    pub collection: &'a str,
    pub op: ChangeOp,
    pub doc_id: &'a str,
    pub payload: &'a Payload,
    pub assumed_modified: Option<&'a str>,
}

/// `SQLite` access to the `change_queue` table
pub struct SqliteQueueRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteQueueRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Append an entry; returns its sequence number
    pub fn enqueue(&self, change: NewChange<'_>, enqueued_at: i64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO change_queue (collection, op, doc_id, payload, assumed_modified, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                change.collection,
                change.op.as_str(),
                change.doc_id,
                serde_json::to_string(change.payload)?,
                change.assumed_modified,
                enqueued_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Oldest pending entries of one collection, or of all collections
    pub fn pending(&self, collection: Option<&str>, limit: usize) -> Result<Vec<ChangeEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, collection, op, doc_id, payload, assumed_modified, enqueued_at, attempts, last_error
             FROM change_queue
             WHERE ?1 IS NULL OR collection = ?1
             ORDER BY seq
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![collection, limit as i64], Self::parse_entry)?;
        rows.map(|row| -> Result<ChangeEntry> {
            let (mut entry, op, payload) = row?;
            entry.op = op.parse()?;
            entry.payload = serde_json::from_str(&payload)?;
            Ok(entry)
        })
        .collect()
    }

    /// Parse an entry from a database row, leaving op and payload to the caller
    fn parse_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<(ChangeEntry, String, String)> {
        Ok((
            ChangeEntry {
                seq: row.get(0)?,
                collection: row.get(1)?,
                op: ChangeOp::Insert,
                doc_id: row.get(3)?,
                payload: Payload::new(),
                assumed_modified: row.get(5)?,
                enqueued_at: row.get(6)?,
                attempts: row.get(7)?,
                last_error: row.get(8)?,
            },
            row.get(2)?,
            row.get(4)?,
        ))
    }

    pub fn count(&self, collection: Option<&str>) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM change_queue WHERE ?1 IS NULL OR collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub fn has_pending(&self, collection: &str, doc_id: &str) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM change_queue WHERE collection = ?1 AND doc_id = ?2)",
            params![collection, doc_id],
            |row| row.get(0),
        )?)
    }

    /// Documents of a collection with at least one pending entry
    pub fn pending_doc_ids(&self, collection: &str) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT doc_id FROM change_queue WHERE collection = ?1")?;
        let ids = stmt.query_map(params![collection], |row| row.get(0))?;
        Ok(ids.collect::<rusqlite::Result<_>>()?)
    }

    /// Remove an acknowledged entry; false if it was already gone
    pub fn remove(&self, seq: i64) -> Result<bool> {
        Ok(self
            .conn
            .execute("DELETE FROM change_queue WHERE seq = ?1", params![seq])?
            > 0)
    }

    pub fn record_failure(&self, seq: i64, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE change_queue SET attempts = attempts + 1, last_error = ?2 WHERE seq = ?1",
            params![seq, error],
        )?;
        Ok(())
    }

    /// Point later entries of a document at a new remote baseline
    pub fn rebase(
        &self,
        collection: &str,
        doc_id: &str,
        after_seq: i64,
        modified: Option<&str>,
    ) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE change_queue SET assumed_modified = ?4
             WHERE collection = ?1 AND doc_id = ?2 AND seq > ?3 AND op != 'insert'",
            params![collection, doc_id, after_seq, modified],
        )?)
    }
}
