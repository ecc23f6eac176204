//! Database layer for Lectern

mod conflict_repository;
mod connection;
mod document_repository;
mod meta_repository;
mod migrations;
mod queue_repository;

pub use conflict_repository::{SqliteConflictRepository, REJECTED, REMOTE_WINS};
pub use connection::Database;
pub use document_repository::{DocumentRepository, SqliteDocumentRepository};
pub use meta_repository::SqliteMetaRepository;
pub use queue_repository::{NewChange, SqliteQueueRepository};
