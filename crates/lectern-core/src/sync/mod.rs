//! Replication engine: pull, push, conflict handling and the orchestrator.

mod gaps;
mod legacy;
mod orchestrator;
mod pull;
mod push;
mod status;

pub use gaps::{detect_content_gaps, is_placeholder, ContentGapListener};
pub use legacy::{
    import_legacy, LegacyImportReport, LegacyImporter, LegacyTable, SqliteLegacyImporter,
};
pub use orchestrator::{needs_sync, Clock, Replicator, ReplicatorBuilder};
pub use pull::{PullCycle, PullEngine, PullMode, PullPage};
pub use push::{PushEngine, PushReport, RejectedChange};
pub use status::{
    CollectionStatus, ContentGapReport, ReplicationPhase, SyncEvent, SyncReport, SyncState,
};
