//! Document repository implementation

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::{Document, Payload};
use crate::schema::CollectionSchema;

/// Trait for per-collection document storage
pub trait DocumentRepository {
    /// Get a document by ID, tombstones included
    fn get(&self, id: &str) -> Result<Option<Document>>;

    /// List documents ordered by ID
    fn list(&self, include_deleted: bool) -> Result<Vec<Document>>;

    /// Insert or replace a document
    fn put(&self, doc: &Document, local_updated_at: i64) -> Result<()>;

    /// Insert a document only if the ID is unused; returns whether it was written
    fn insert_if_absent(&self, doc: &Document, local_updated_at: i64) -> Result<bool>;

    /// Record the remote marker of an acknowledged write
    fn set_modified(&self, id: &str, modified: Option<&str>) -> Result<()>;

    /// Conflict clock value stamped by the last conflict resolution
    fn conflict_rev(&self, id: &str) -> Result<i64>;

    fn set_conflict_rev(&self, id: &str, rev: i64) -> Result<()>;

    /// Physically remove a document
    fn remove(&self, id: &str) -> Result<bool>;
}

/// `SQLite` implementation of `DocumentRepository`
pub struct SqliteDocumentRepository<'a> {
    conn: &'a Connection,
    schema: &'a CollectionSchema,
}

impl<'a> SqliteDocumentRepository<'a> {
    /// Create a repository for one collection's table
    pub const fn new(conn: &'a Connection, schema: &'a CollectionSchema) -> Self {
        Self { conn, schema }
    }

    fn table(&self) -> &'static str {
        self.schema.name
    }

    /// Parse a document from a database row
    fn parse_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Document, String)> {
        let payload: String = row.get(1)?;
        Ok((
            Document {
                id: row.get(0)?,
                deleted: row.get::<_, i32>(2)? != 0,
                modified: row.get(3)?,
                payload: Payload::new(),
            },
            payload,
        ))
    }

    fn hydrate((mut doc, payload): (Document, String)) -> Result<Document> {
        doc.payload = serde_json::from_str(&payload)?;
        Ok(doc)
    }
}

impl DocumentRepository for SqliteDocumentRepository<'_> {
    fn get(&self, id: &str) -> Result<Option<Document>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT id, payload, deleted, modified FROM \"{}\" WHERE id = ?",
                    self.table()
                ),
                params![id],
                Self::parse_document,
            )
            .optional()?;
        row.map(Self::hydrate).transpose()
    }

    fn list(&self, include_deleted: bool) -> Result<Vec<Document>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, payload, deleted, modified FROM \"{}\"
             WHERE deleted = 0 OR ?1
             ORDER BY id",
            self.table()
        ))?;
        let rows = stmt.query_map(params![include_deleted], Self::parse_document)?;
        rows.map(|row| -> Result<Document> { Self::hydrate(row?) })
            .collect()
    }

    fn put(&self, doc: &Document, local_updated_at: i64) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO \"{}\" (id, payload, deleted, modified, local_updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    payload = excluded.payload,
                    deleted = excluded.deleted,
                    modified = excluded.modified,
                    local_updated_at = excluded.local_updated_at",
                self.table()
            ),
            params![
                doc.id,
                serde_json::to_string(&doc.payload)?,
                i32::from(doc.deleted),
                doc.modified,
                local_updated_at,
            ],
        )?;
        Ok(())
    }

    fn insert_if_absent(&self, doc: &Document, local_updated_at: i64) -> Result<bool> {
        let inserted = self.conn.execute(
            &format!(
                "INSERT OR IGNORE INTO \"{}\" (id, payload, deleted, modified, local_updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                self.table()
            ),
            params![
                doc.id,
                serde_json::to_string(&doc.payload)?,
                i32::from(doc.deleted),
                doc.modified,
                local_updated_at,
            ],
        )?;
        Ok(inserted > 0)
    }

    fn set_modified(&self, id: &str, modified: Option<&str>) -> Result<()> {
        self.conn.execute(
            &format!("UPDATE \"{}\" SET modified = ?2 WHERE id = ?1", self.table()),
            params![id, modified],
        )?;
        Ok(())
    }

    fn conflict_rev(&self, id: &str) -> Result<i64> {
        let rev = self
            .conn
            .query_row(
                &format!("SELECT conflict_rev FROM \"{}\" WHERE id = ?", self.table()),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(rev.unwrap_or(0))
    }

    fn set_conflict_rev(&self, id: &str, rev: i64) -> Result<()> {
        self.conn.execute(
            &format!(
                "UPDATE \"{}\" SET conflict_rev = ?2 WHERE id = ?1",
                self.table()
            ),
            params![id, rev],
        )?;
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<bool> {
        let removed = self.conn.execute(
            &format!("DELETE FROM \"{}\" WHERE id = ?", self.table()),
            params![id],
        )?;
        Ok(removed > 0)
    }
}
