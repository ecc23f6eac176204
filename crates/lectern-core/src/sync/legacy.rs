//! One-time import from an older on-device replica.

use std::path::PathBuf;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::{Number, Value};

use crate::models::Document;
use crate::schema::{self, row_to_document, CollectionSchema, Row, COLLECTIONS};
use crate::services::LocalStore;
use crate::util::rfc3339_now;
use crate::Result;

/// Rows of one collection exported by a legacy store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTable {
    pub collection: String,
    pub rows: Vec<Row>,
}

/// Source of documents written by an earlier version of the app.
#[async_trait]
pub trait LegacyImporter: Send + Sync {
    fn name(&self) -> &str;

    /// Whether there is anything to import on this device.
    async fn is_available(&self) -> bool;

    async fn export(&self) -> Result<Vec<LegacyTable>>;
}

/// Reads an older `SQLite` replica with one table per collection.
#[derive(Debug, Clone)]
pub struct SqliteLegacyImporter {
    path: PathBuf,
}

impl SqliteLegacyImporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_tables(&self) -> Result<Vec<LegacyTable>> {
        let conn = Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let mut tables = Vec::new();
        for schema in COLLECTIONS {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
                [schema.name],
                |row| row.get(0),
            )?;
            if exists {
                tables.push(LegacyTable {
                    collection: schema.name.to_string(),
                    rows: read_rows(&conn, schema.name)?,
                });
            }
        }
        Ok(tables)
    }
}

fn read_rows(conn: &Connection, table: &str) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM \"{table}\""))?;
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(ToString::to_string)
        .collect();
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (index, column) in columns.iter().enumerate() {
            record.insert(column.clone(), sql_to_json(row.get_ref(index)?));
        }
        out.push(record);
    }
    Ok(out)
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => Value::Null,
        ValueRef::Integer(number) => Value::from(number),
        ValueRef::Real(number) => Number::from_f64(number).map_or(Value::Null, Value::Number),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
    }
}

#[async_trait]
impl LegacyImporter for SqliteLegacyImporter {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn is_available(&self) -> bool {
        self.path.is_file()
    }

    async fn export(&self) -> Result<Vec<LegacyTable>> {
        self.read_tables()
    }
}

/// Outcome of [`import_legacy`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyImportReport {
    pub already_complete: bool,
    pub imported: usize,
    pub skipped: usize,
}

/// Normalize a legacy row before conversion.
///
/// Soft-deleted rows are dropped. Missing `updated_at` falls back to
/// `created_at`, then to the import time.
fn normalize_row(mut row: Row, now: &str) -> Option<Row> {
    for flag in ["_deleted", "deleted"] {
        match row.remove(flag) {
            Some(Value::Bool(true)) => return None,
            Some(Value::Number(number)) if number.as_i64() == Some(1) => return None,
            _ => {}
        }
    }
    let has_modified = row
        .get(CollectionSchema::MODIFIED_FIELD)
        .is_some_and(|value| !value.is_null());
    if !has_modified {
        let fallback = row
            .get(CollectionSchema::CREATED_FIELD)
            .filter(|value| value.is_string())
            .cloned()
            .unwrap_or_else(|| Value::String(now.to_string()));
        row.insert(CollectionSchema::MODIFIED_FIELD.to_string(), fallback);
    }
    Some(row)
}

/// Run the legacy import once per store.
///
/// Imported documents count as already synced: no queue entries are created
/// and existing documents are never overwritten. The completion flag is set
/// with the documents, or immediately when the importer has nothing to offer.
pub async fn import_legacy(
    store: &LocalStore,
    importer: &dyn LegacyImporter,
) -> Result<LegacyImportReport> {
    if store.legacy_import_complete().await? {
        return Ok(LegacyImportReport {
            already_complete: true,
            ..LegacyImportReport::default()
        });
    }
    if !importer.is_available().await {
        tracing::info!("No {} legacy store found; skipping import", importer.name());
        store.mark_legacy_import_complete().await?;
        return Ok(LegacyImportReport::default());
    }

    let now = rfc3339_now();
    let mut report = LegacyImportReport::default();
    let mut batches: Vec<(&CollectionSchema, Vec<Document>)> = Vec::new();
    for table in importer.export().await? {
        let Ok(schema) = schema::collection(&table.collection) else {
            tracing::warn!("Ignoring legacy table {}", table.collection);
            continue;
        };
        let mut documents = Vec::with_capacity(table.rows.len());
        for row in table.rows {
            let Some(row) = normalize_row(row, &now) else {
                report.skipped += 1;
                continue;
            };
            match row_to_document(schema, &row) {
                Ok(doc) => documents.push(doc),
                Err(error) => {
                    tracing::warn!("Skipping legacy row: {error}");
                    report.skipped += 1;
                }
            }
        }
        batches.push((schema, documents));
    }

    report.imported = store.import_documents(&batches).await?;
    tracing::info!(
        "Imported {} document(s) from {} legacy store ({} skipped)",
        report.imported,
        importer.name(),
        report.skipped
    );
    Ok(report)
}
