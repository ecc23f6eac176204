//! Database connection management

use std::path::Path;

use rusqlite::Connection;

use super::migrations;
use crate::error::Result;
use crate::schema::CollectionSchema;

/// Database wrapper for the local `SQLite` replica
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations and creates tables for every registered collection.
    pub fn open(path: impl AsRef<Path>, collections: &[CollectionSchema]) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, collections)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory(collections: &[CollectionSchema]) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, collections)
    }

    fn init(conn: Connection, collections: &[CollectionSchema]) -> Result<Self> {
        let mut database = Self { conn };
        database.configure()?;
        migrations::run(&mut database.conn, collections)?;
        Ok(database)
    }

    /// Configure `SQLite` for a single-writer local replica
    fn configure(&self) -> Result<()> {
        // In-memory databases refuse WAL
        self.conn
            .query_row("PRAGMA journal_mode = WAL;", [], |_| Ok(()))
            .ok();
        self.conn.execute_batch("PRAGMA synchronous = NORMAL;").ok();
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch("PRAGMA cache_size = 10000;").ok();
        Ok(())
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Get a mutable reference, needed to open transactions
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}
