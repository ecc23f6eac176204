//! Conflict models

use serde::{Deserialize, Serialize};

use super::Document;

/// Authoritative remote state returned when a push fails its precondition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub collection: String,
    pub doc_id: String,
    /// Marker the rejected write assumed
    pub assumed_modified: Option<String>,
    /// Current remote document, or `None` when the row no longer exists
    pub remote: Option<Document>,
}

impl ConflictRecord {
    pub fn remote_modified(&self) -> Option<&str> {
        self.remote.as_ref().and_then(|doc| doc.modified.as_deref())
    }
}

/// Recorded conflict resolution kept for auditing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Collection the document belongs to
    pub collection: String,
    /// Document involved in the conflict
    pub document_id: String,
    /// Marker the local write was based on
    pub local_modified: Option<String>,
    /// Remote marker that won
    pub remote_modified: Option<String>,
    /// Resolution timestamp (unix ms)
    pub resolved_at: i64,
    /// Resolution strategy name
    pub strategy: String,
}
