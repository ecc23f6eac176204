//! Conflict audit log

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::models::{ConflictRecord, SyncConflict};

pub const REMOTE_WINS: &str = "remote_wins";
/// The remote refused the write; its state replaced the local document
pub const REJECTED: &str = "rejected";

/// `SQLite` access to the `sync_conflicts` table
pub struct SqliteConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteConflictRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn record(&self, conflict: &ConflictRecord, strategy: &str, resolved_at: i64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO sync_conflicts
                (collection, document_id, local_modified, remote_modified, resolved_at, strategy)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conflict.collection,
                conflict.doc_id,
                conflict.assumed_modified,
                conflict.remote_modified(),
                resolved_at,
                strategy,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent resolutions first
    pub fn list(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, collection, document_id, local_modified, remote_modified, resolved_at, strategy
             FROM sync_conflicts
             ORDER BY resolved_at DESC, id DESC
             LIMIT ?",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(SyncConflict {
                id: row.get(0)?,
                collection: row.get(1)?,
                document_id: row.get(2)?,
                local_modified: row.get(3)?,
                remote_modified: row.get(4)?,
                resolved_at: row.get(5)?,
                strategy: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::Document;
    use crate::schema::COLLECTIONS;
    use pretty_assertions::assert_eq;

    #[test]
    fn conflicts_list_newest_first() {
        let db = Database::open_in_memory(COLLECTIONS).unwrap();
        let repo = SqliteConflictRepository::new(db.connection());

        for (doc_id, at, strategy) in [
            ("a", 100, REMOTE_WINS),
            ("b", 300, REMOTE_WINS),
            ("c", 200, REJECTED),
        ] {
            repo.record(
                &ConflictRecord {
                    collection: "user_preferences".to_string(),
                    doc_id: doc_id.to_string(),
                    assumed_modified: Some("m1".to_string()),
                    remote: Some(Document::new(doc_id, Default::default()).with_modified("m2")),
                },
                strategy,
                at,
            )
            .unwrap();
        }

        let conflicts = repo.list(2).unwrap();
        assert_eq!(
            conflicts
                .iter()
                .map(|c| c.document_id.as_str())
                .collect::<Vec<_>>(),
            vec!["b", "c"]
        );
        assert_eq!(conflicts[0].strategy, REMOTE_WINS);
        assert_eq!(conflicts[1].strategy, REJECTED);
        assert_eq!(conflicts[0].local_modified.as_deref(), Some("m1"));
        assert_eq!(conflicts[0].remote_modified.as_deref(), Some("m2"));
    }
}
