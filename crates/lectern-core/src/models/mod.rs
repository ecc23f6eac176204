//! Data models for Lectern

mod change;
mod checkpoint;
mod conflict;
mod document;
mod preferences;

pub use change::{ChangeEntry, ChangeOp};
pub use checkpoint::Checkpoint;
pub use conflict::{ConflictRecord, SyncConflict};
pub use document::{new_document_id, Document, Payload};
pub use preferences::{Pace, Preferences};
