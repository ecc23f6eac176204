//! Replication state shared with callers.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::ConflictRecord;

/// Unified sync state shown by clients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Offline,
    #[default]
    Syncing,
    Synced,
    Error,
}

impl SyncState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }

    /// Combine per-collection states into one indicator.
    ///
    /// Errors dominate, then in-progress work, then offline collections.
    pub fn aggregate(states: impl IntoIterator<Item = Self>) -> Self {
        let mut combined = Self::Synced;
        for state in states {
            combined = match (combined, state) {
                (Self::Error, _) | (_, Self::Error) => Self::Error,
                (Self::Syncing, _) | (_, Self::Syncing) => Self::Syncing,
                (Self::Offline, _) | (_, Self::Offline) => Self::Offline,
                _ => Self::Synced,
            };
        }
        combined
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one collection's replication.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationPhase {
    #[default]
    Stopped,
    /// Pulling until the first full pass completes
    Initializing,
    SteadyState,
    /// Waiting for connectivity after repeated transient failures
    Paused,
}

impl ReplicationPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Initializing => "initializing",
            Self::SteadyState => "steady_state",
            Self::Paused => "paused",
        }
    }
}

/// Snapshot of one collection's replication.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CollectionStatus {
    pub phase: ReplicationPhase,
    pub state: SyncState,
    pub initial_replication_done: bool,
    /// Completed pull cycles since start
    pub pull_cycles: u64,
    pub consecutive_failures: u32,
    pub last_pull_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Content indexes the caller should ask the generator for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContentGapReport {
    pub collection: &'static str,
    pub missing: Vec<u64>,
    /// Cached rows whose generated payload is a placeholder
    pub placeholders: Vec<u64>,
}

impl ContentGapReport {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.placeholders.is_empty()
    }

    /// All gap indexes in ascending order.
    pub fn indexes(&self) -> Vec<u64> {
        let mut indexes: Vec<u64> = self
            .missing
            .iter()
            .chain(&self.placeholders)
            .copied()
            .collect();
        indexes.sort_unstable();
        indexes.dedup();
        indexes
    }
}

/// Notifications published by the replicator.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    StatusChanged {
        collection: &'static str,
        status: CollectionStatus,
    },
    ConflictResolved(ConflictRecord),
    ContentGaps(ContentGapReport),
    CycleFailed {
        collection: &'static str,
        error: String,
    },
}

/// Result of a manual push-then-pull round.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub pushed: usize,
    pub conflicts: usize,
    /// Writes the remote refused; the remote state was kept
    pub rejected: usize,
    pub pulled: usize,
    pub pruned: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn aggregate_prefers_error_then_syncing() {
        use SyncState::{Error, Offline, Synced, Syncing};
        assert_eq!(SyncState::aggregate([]), Synced);
        assert_eq!(SyncState::aggregate([Synced, Synced]), Synced);
        assert_eq!(SyncState::aggregate([Synced, Offline]), Offline);
        assert_eq!(SyncState::aggregate([Offline, Syncing]), Syncing);
        assert_eq!(SyncState::aggregate([Syncing, Error, Synced]), Error);
    }

    #[test]
    fn gap_indexes_are_sorted_and_unique() {
        let report = ContentGapReport {
            collection: "content_cache",
            missing: vec![30, 12],
            placeholders: vec![12, 5],
        };
        assert_eq!(report.indexes(), vec![5, 12, 30]);
        assert!(!report.is_empty());
    }
}
