use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] lectern_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Document payload must be a JSON object")]
    PayloadNotObject,
    #[error("Invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("Document not found: {collection}/{id}")]
    DocumentNotFound { collection: String, id: String },
    #[error("Legacy store not found at {0}")]
    LegacyStoreMissing(String),
    #[error(
        "Sync is not configured. Run `lectern config init` with --supabase-url, --supabase-anon-key and --user-id, and set LECTERN_ACCESS_TOKEN."
    )]
    SyncNotConfigured,
}
