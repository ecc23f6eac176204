//! Database migrations

use rusqlite::Connection;

use crate::error::Result;
use crate::schema::CollectionSchema;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations, then make sure every collection has a table
pub fn run(conn: &mut Connection, collections: &[CollectionSchema]) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    ensure_collection_tables(conn, collections)
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn apply(conn: &mut Connection, statements: &[&str]) -> Result<()> {
    let tx = conn.transaction()?;
    for stmt in statements {
        tx.execute(stmt, [])?;
    }
    tx.commit()?;
    Ok(())
}

/// Migration to version 1: change queue and sync metadata
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    apply(
        conn,
        &[
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            // Local writes awaiting push, drained in seq order
            "CREATE TABLE IF NOT EXISTS change_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                op TEXT NOT NULL CHECK (op IN ('insert', 'update', 'delete')),
                doc_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                assumed_modified TEXT,
                enqueued_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_change_queue_doc ON change_queue(collection, doc_id)",
            // Checkpoints, flags and counters
            "CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            "INSERT INTO schema_version (version) VALUES (1)",
        ],
    )?;
    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: conflict audit log
fn migrate_v2(conn: &mut Connection) -> Result<()> {
    apply(
        conn,
        &[
            "CREATE TABLE IF NOT EXISTS sync_conflicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                document_id TEXT NOT NULL,
                local_modified TEXT,
                remote_modified TEXT,
                resolved_at INTEGER NOT NULL,
                strategy TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved_at ON sync_conflicts(resolved_at DESC)",
            "INSERT INTO schema_version (version) VALUES (2)",
        ],
    )?;
    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

/// One document table per registered collection.
fn ensure_collection_tables(conn: &mut Connection, collections: &[CollectionSchema]) -> Result<()> {
    let tx = conn.transaction()?;
    for schema in collections {
        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{name}\" (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                modified TEXT,
                local_updated_at INTEGER NOT NULL DEFAULT 0,
                conflict_rev INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS \"idx_{name}_deleted\" ON \"{name}\"(deleted);",
            name = schema.name
        ))?;
    }
    tx.commit()?;
    Ok(())
}
