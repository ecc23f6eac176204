//! Change-queue drain with optimistic concurrency.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::config::SyncConfig;
use crate::models::{ChangeEntry, ChangeOp, ConflictRecord, Document};
use crate::remote::{
    with_timeout, Precondition, RemoteError, RemoteErrorKind, RemoteResult, RemoteStore,
};
use crate::schema::{self, document_to_row, row_to_document, CollectionSchema, Row, WritePolicy};
use crate::services::LocalStore;
use crate::Result;

/// Outcome of a drain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushReport {
    /// Entries acknowledged by the remote
    pub applied: usize,
    /// Entries resolved remote-wins
    pub conflicts: Vec<ConflictRecord>,
    /// Entries the remote refused; resolved remote-wins and dropped
    pub rejected: Vec<RejectedChange>,
    /// First failure that stopped a document's entries; they stay queued
    pub failure: Option<RemoteError>,
}

impl PushReport {
    fn merge(&mut self, other: Self) {
        self.applied += other.applied;
        self.conflicts.extend(other.conflicts);
        self.rejected.extend(other.rejected);
        if self.failure.is_none() {
            self.failure = other.failure;
        } else if other.failure.as_ref().is_some_and(RemoteError::is_fatal) {
            // A fatal failure outranks a transient one
            self.failure = other.failure;
        }
    }
}

/// A queued write the remote refused outright.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedChange {
    pub op: ChangeOp,
    pub reason: String,
    /// Remote state the local document fell back to
    pub resolution: ConflictRecord,
}

enum Applied {
    /// Acknowledged; carries the row as stored when the remote returned it
    Ack(Option<Document>),
    Conflict(ConflictRecord),
}

/// Drains the change queue against the remote store.
#[derive(Clone)]
pub struct PushEngine {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    config: Arc<SyncConfig>,
}

impl PushEngine {
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteStore>, config: Arc<SyncConfig>) -> Self {
        Self {
            store,
            remote,
            config,
        }
    }

    /// Push pending entries in batches until the queue is empty or a push fails.
    ///
    /// Entries of one document run in queue order; different documents in a
    /// batch run concurrently. `collection` limits the drain to one collection.
    pub async fn drain(&self, collection: Option<&str>) -> Result<PushReport> {
        let mut report = PushReport::default();
        loop {
            let entries = self
                .store
                .pending_changes(collection, self.config.push_batch_size.max(1))
                .await?;
            if entries.is_empty() {
                break;
            }

            let results: Vec<Result<PushReport>> = stream::iter(group_by_document(entries))
                .map(|group| self.push_group(group))
                .buffer_unordered(self.config.push_concurrency.max(1))
                .collect()
                .await;

            let mut batch = PushReport::default();
            for result in results {
                batch.merge(result?);
            }
            let progressed = batch.applied + batch.conflicts.len() + batch.rejected.len();
            let stopped = batch.failure.is_some();
            report.merge(batch);
            if stopped || progressed == 0 {
                break;
            }
        }

        if report.applied > 0 || !report.conflicts.is_empty() || !report.rejected.is_empty() {
            tracing::info!(
                "Pushed {} change(s), {} conflict(s), {} rejected",
                report.applied,
                report.conflicts.len(),
                report.rejected.len()
            );
        }
        Ok(report)
    }

    /// Push one document's entries in order, stopping at the first failure.
    async fn push_group(&self, group: Vec<ChangeEntry>) -> Result<PushReport> {
        let mut report = PushReport::default();
        // Marker of the remote row after the previous entry of this group
        let mut baseline: Option<Option<String>> = None;

        for mut entry in group {
            let schema = schema::collection(&entry.collection)?;
            if entry.op != ChangeOp::Insert {
                if let Some(marker) = &baseline {
                    entry.assumed_modified.clone_from(marker);
                }
            }

            match self.apply(schema, &entry).await {
                Ok(Applied::Ack(stored)) => {
                    baseline = Some(stored.as_ref().and_then(|doc| doc.modified.clone()));
                    self.store.acknowledge(&entry, stored.as_ref()).await?;
                    report.applied += 1;
                }
                Ok(Applied::Conflict(conflict)) => {
                    tracing::warn!(
                        "Conflict pushing {} {}/{}; remote wins",
                        entry.op,
                        conflict.collection,
                        conflict.doc_id
                    );
                    baseline = Some(conflict.remote_modified().map(ToString::to_string));
                    self.store.apply_conflict(&entry, &conflict).await?;
                    report.conflicts.push(conflict);
                }
                Err(error) if error.kind == RemoteErrorKind::Rejected => {
                    tracing::warn!(
                        "Remote rejected {} {}/{}: {error}; restoring remote state",
                        entry.op,
                        entry.collection,
                        entry.doc_id
                    );
                    let resolution = match self.remote_state(schema, &entry).await {
                        Ok(resolution) => resolution,
                        Err(error) => {
                            self.store
                                .record_push_failure(&entry, &error.to_string())
                                .await?;
                            report.failure = Some(error);
                            break;
                        }
                    };
                    baseline = Some(resolution.remote_modified().map(ToString::to_string));
                    self.store.apply_rejection(&entry, &resolution).await?;
                    report.rejected.push(RejectedChange {
                        op: entry.op,
                        reason: error.message,
                        resolution,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        "Failed to push {} {}/{}: {error}",
                        entry.op,
                        entry.collection,
                        entry.doc_id
                    );
                    self.store
                        .record_push_failure(&entry, &error.to_string())
                        .await?;
                    report.failure = Some(error);
                    break;
                }
            }
        }
        Ok(report)
    }

    async fn apply(
        &self,
        schema: &'static CollectionSchema,
        entry: &ChangeEntry,
    ) -> RemoteResult<Applied> {
        let timeout = self.config.request_timeout;
        let table = schema.name;
        let row = document_to_row(schema, &entry.doc_id, &entry.payload, entry.op);

        match entry.op {
            ChangeOp::Insert => match with_timeout(timeout, self.remote.insert(table, &row)).await {
                Ok(stored) => Ok(Applied::Ack(convert(schema, &stored))),
                Err(error) if error.kind == RemoteErrorKind::DuplicateKey => {
                    tracing::debug!("{table}/{} already inserted", entry.doc_id);
                    let stored =
                        with_timeout(timeout, self.remote.fetch(table, &entry.doc_id)).await?;
                    Ok(Applied::Ack(
                        stored.and_then(|stored| convert(schema, &stored)),
                    ))
                }
                Err(error) => Err(error),
            },
            ChangeOp::Update => {
                let precondition = match (schema.write_policy, entry.assumed_modified.as_deref()) {
                    (WritePolicy::Conditional, Some(marker)) => Some(Precondition::modified(marker)),
                    _ => None,
                };
                let updated = with_timeout(
                    timeout,
                    self.remote
                        .update(table, &entry.doc_id, &row, precondition.as_ref()),
                )
                .await?;
                if let Some(stored) = updated {
                    return Ok(Applied::Ack(convert(schema, &stored)));
                }
                Ok(Applied::Conflict(self.remote_state(schema, entry).await?))
            }
            ChangeOp::Delete => {
                if !with_timeout(timeout, self.remote.delete(table, &entry.doc_id)).await? {
                    tracing::debug!("{table}/{} was already deleted", entry.doc_id);
                }
                Ok(Applied::Ack(None))
            }
        }
    }

    /// The authoritative remote row for an entry's document.
    async fn remote_state(
        &self,
        schema: &'static CollectionSchema,
        entry: &ChangeEntry,
    ) -> RemoteResult<ConflictRecord> {
        let current = with_timeout(
            self.config.request_timeout,
            self.remote.fetch(schema.name, &entry.doc_id),
        )
        .await?;
        Ok(ConflictRecord {
            collection: schema.name.to_string(),
            doc_id: entry.doc_id.clone(),
            assumed_modified: entry.assumed_modified.clone(),
            remote: current.and_then(|current| convert(schema, &current)),
        })
    }
}

fn convert(schema: &CollectionSchema, row: &Row) -> Option<Document> {
    row_to_document(schema, row)
        .map_err(|error| tracing::warn!("Ignoring returned {} row: {error}", schema.name))
        .ok()
}

/// Split a FIFO batch into per-document groups, preserving order in each.
fn group_by_document(entries: Vec<ChangeEntry>) -> Vec<Vec<ChangeEntry>> {
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut groups: Vec<Vec<ChangeEntry>> = Vec::new();
    for entry in entries {
        let key = (entry.collection.clone(), entry.doc_id.clone());
        match index.get(&key) {
            Some(&position) => groups[position].push(entry),
            None => {
                index.insert(key, groups.len());
                groups.push(vec![entry]);
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Payload;
    use crate::remote::MemoryRemote;
    use crate::schema::registry::{LEARNING_PATH, USER_PREFERENCES};
    use crate::sync::pull::{PullEngine, PullMode};
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    async fn setup(remote: &MemoryRemote, config: SyncConfig) -> (LocalStore, PushEngine) {
        let store = LocalStore::open_in_memory().await.unwrap();
        let engine = PushEngine::new(store.clone(), Arc::new(remote.clone()), Arc::new(config));
        (store, engine)
    }

    fn pull(store: &LocalStore, remote: &MemoryRemote, name: &str) -> PullEngine {
        PullEngine::new(
            store.clone(),
            Arc::new(remote.clone()),
            Arc::new(SyncConfig::default()),
            schema::collection(name).unwrap(),
            "u1",
        )
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()
    }

    #[test]
    fn groups_keep_per_document_order() {
        let entry = |seq: i64, doc: &str| ChangeEntry {
            seq,
            collection: USER_PREFERENCES.to_string(),
            op: ChangeOp::Update,
            doc_id: doc.to_string(),
            payload: Payload::new(),
            assumed_modified: None,
            enqueued_at: 0,
            attempts: 0,
            last_error: None,
        };
        let groups = group_by_document(vec![entry(1, "a"), entry(2, "b"), entry(3, "a")]);
        let seqs: Vec<Vec<i64>> = groups
            .iter()
            .map(|group| group.iter().map(|entry| entry.seq).collect())
            .collect();
        assert_eq!(seqs, vec![vec![1, 3], vec![2]]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drains_insert_update_delete_in_order() {
        let remote = MemoryRemote::new();
        let (store, push) = setup(&remote, SyncConfig::default()).await;

        store
            .insert(
                USER_PREFERENCES,
                payload(json!({"id": "p1", "user_id": "u1", "pace": "one_chapter", "yom_tov_dates": []})),
            )
            .await
            .unwrap();
        store
            .update(USER_PREFERENCES, "p1", payload(json!({"pace": "two_mishna"})))
            .await
            .unwrap();

        let report = push.drain(None).await.unwrap();
        assert_eq!(report.applied, 2);
        assert!(report.conflicts.is_empty());
        assert_eq!(store.pending_count(None).await.unwrap(), 0);

        let stored = remote.row(USER_PREFERENCES, "p1").unwrap();
        assert_eq!(stored["pace"], json!("two_mishna"));
        assert!(!stored.contains_key("yom_tov_dates"));
        let local = store.get(USER_PREFERENCES, "p1").await.unwrap().unwrap();
        assert_eq!(local.modified.as_ref(), stored["updated_at"].as_str().map(String::from).as_ref());

        store.delete(USER_PREFERENCES, "p1").await.unwrap();
        push.drain(None).await.unwrap();
        assert!(remote.row(USER_PREFERENCES, "p1").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replayed_insert_does_not_duplicate() {
        let remote = MemoryRemote::new();
        let (store, push) = setup(&remote, SyncConfig::default()).await;
        store
            .insert(USER_PREFERENCES, payload(json!({"id": "p1", "user_id": "u1"})))
            .await
            .unwrap();

        // The remote applied the insert but the process died before acknowledging it
        let entry = store.pending_changes(None, 1).await.unwrap().remove(0);
        remote
            .insert(
                USER_PREFERENCES,
                &document_to_row(
                    schema::collection(USER_PREFERENCES).unwrap(),
                    &entry.doc_id,
                    &entry.payload,
                    ChangeOp::Insert,
                ),
            )
            .await
            .unwrap();

        let report = push.drain(None).await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(remote.rows(USER_PREFERENCES).len(), 1);
        assert_eq!(store.pending_count(None).await.unwrap(), 0);
        assert!(store
            .get(USER_PREFERENCES, "p1")
            .await
            .unwrap()
            .unwrap()
            .modified
            .is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deleting_a_missing_row_is_acknowledged() {
        let remote = MemoryRemote::new();
        remote.seed(USER_PREFERENCES, [payload(json!({"id": "p1", "user_id": "u1"}))]);
        let (store, push) = setup(&remote, SyncConfig::default()).await;
        pull(&store, &remote, USER_PREFERENCES)
            .run_cycle(today(), PullMode::Incremental)
            .await
            .unwrap();

        store.delete(USER_PREFERENCES, "p1").await.unwrap();
        remote.remove(USER_PREFERENCES, "p1");
        let report = push.drain(None).await.unwrap();
        assert_eq!(report.applied, 1);
        assert!(report.failure.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_remote_update_converges_to_remote() {
        let remote = MemoryRemote::new();
        remote.seed(
            USER_PREFERENCES,
            [payload(json!({"id": "p1", "user_id": "u1", "pace": "one_chapter"}))],
        );
        let (store, push) = setup(&remote, SyncConfig::default()).await;
        let prefs = pull(&store, &remote, USER_PREFERENCES);
        prefs.run_cycle(today(), PullMode::Incremental).await.unwrap();

        store
            .update(
                USER_PREFERENCES,
                "p1",
                payload(json!({"pace": "two_mishna", "yom_tov_dates": ["2026-10-03"]})),
            )
            .await
            .unwrap();
        remote.mutate(USER_PREFERENCES, "p1", payload(json!({"pace": "seder_per_year"})));

        let report = push.drain(None).await.unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.conflicts.len(), 1);
        assert!(report.failure.is_none());
        prefs.run_cycle(today(), PullMode::Restart).await.unwrap();

        let local = store.get(USER_PREFERENCES, "p1").await.unwrap().unwrap();
        let remote_row = remote.row(USER_PREFERENCES, "p1").unwrap();
        assert_eq!(local.str_field("pace"), Some("seder_per_year"));
        assert_eq!(local.modified.as_deref(), remote_row["updated_at"].as_str());
        assert!(local.field("yom_tov_dates").is_some());
        assert!(!store.has_pending(USER_PREFERENCES, "p1").await.unwrap());
        assert_eq!(store.list_sync_conflicts(10).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn later_entries_rebase_onto_conflict_marker() {
        let remote = MemoryRemote::new();
        remote.seed(
            USER_PREFERENCES,
            [payload(json!({"id": "p1", "user_id": "u1", "pace": "one_chapter"}))],
        );
        let (store, push) = setup(&remote, SyncConfig::default()).await;
        pull(&store, &remote, USER_PREFERENCES)
            .run_cycle(today(), PullMode::Incremental)
            .await
            .unwrap();

        store
            .update(USER_PREFERENCES, "p1", payload(json!({"pace": "two_mishna"})))
            .await
            .unwrap();
        store
            .update(USER_PREFERENCES, "p1", payload(json!({"current_content_index": 41})))
            .await
            .unwrap();
        remote.mutate(USER_PREFERENCES, "p1", payload(json!({"pace": "seder_per_year"})));

        let report = push.drain(None).await.unwrap();
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.applied, 1);
        let stored = remote.row(USER_PREFERENCES, "p1").unwrap();
        assert_eq!(stored["current_content_index"], json!(41));
        assert_eq!(stored["pace"], json!("seder_per_year"));

        let local = store.get(USER_PREFERENCES, "p1").await.unwrap().unwrap();
        assert_eq!(local.int_field("current_content_index"), Some(41));
        assert_eq!(local.str_field("pace"), Some("seder_per_year"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_of_remotely_deleted_row_drops_local_document() {
        let remote = MemoryRemote::new();
        remote.seed(
            LEARNING_PATH,
            [payload(json!({"id": "n1", "user_id": "u1", "node_index": 0}))],
        );
        let (store, push) = setup(&remote, SyncConfig::default()).await;
        pull(&store, &remote, LEARNING_PATH)
            .run_cycle(today(), PullMode::Incremental)
            .await
            .unwrap();

        store
            .update(LEARNING_PATH, "n1", payload(json!({"completed_at": "2026-10-16"})))
            .await
            .unwrap();
        remote.remove(LEARNING_PATH, "n1");

        let report = push.drain(None).await.unwrap();
        assert_eq!(report.conflicts[0].remote, None);
        assert!(store.get_including_deleted(LEARNING_PATH, "n1").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_failure_keeps_entries_queued() {
        let remote = MemoryRemote::new();
        let (store, push) = setup(&remote, SyncConfig::default()).await;
        store
            .insert(USER_PREFERENCES, payload(json!({"id": "p1", "user_id": "u1"})))
            .await
            .unwrap();
        store
            .update(USER_PREFERENCES, "p1", payload(json!({"pace": "two_mishna"})))
            .await
            .unwrap();

        remote.fail_next(RemoteError::transient("connection reset"));
        let report = push.drain(None).await.unwrap();
        assert!(report.failure.as_ref().is_some_and(RemoteError::is_retryable));
        let pending = store.pending_changes(None, 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].attempts, 1);

        let report = push.drain(None).await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(remote.row(USER_PREFERENCES, "p1").unwrap()["pace"], json!("two_mishna"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replayed_insert_stays_queued_when_refetch_fails() {
        let remote = MemoryRemote::new();
        let (store, push) = setup(&remote, SyncConfig::default()).await;
        store
            .insert(USER_PREFERENCES, payload(json!({"id": "p1", "user_id": "u1"})))
            .await
            .unwrap();
        store
            .update(USER_PREFERENCES, "p1", payload(json!({"pace": "two_mishna"})))
            .await
            .unwrap();

        remote.fail_next(RemoteError::duplicate_key("23505"));
        remote.fail_next(RemoteError::timeout(Duration::from_secs(10)));
        let report = push.drain(None).await.unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.failure.map(|error| error.kind), Some(RemoteErrorKind::Timeout));
        assert_eq!(store.pending_count(None).await.unwrap(), 2);

        let report = push.drain(None).await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(remote.row(USER_PREFERENCES, "p1").unwrap()["pace"], json!("two_mishna"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_entry_restores_remote_state_and_queue_moves_on() {
        let remote = MemoryRemote::new();
        remote.seed(
            USER_PREFERENCES,
            [payload(json!({"id": "p1", "user_id": "u1", "pace": "one_chapter"}))],
        );
        let (store, push) = setup(&remote, SyncConfig::default()).await;
        pull(&store, &remote, USER_PREFERENCES)
            .run_cycle(today(), PullMode::Incremental)
            .await
            .unwrap();

        store
            .update(USER_PREFERENCES, "p1", payload(json!({"pace": "three_mishna"})))
            .await
            .unwrap();
        store
            .update(USER_PREFERENCES, "p1", payload(json!({"current_content_index": 41})))
            .await
            .unwrap();
        remote.fail_next(RemoteError::rejected("new row violates check constraint (400)"));

        let report = push.drain(None).await.unwrap();
        assert!(report.failure.is_none());
        assert_eq!(report.applied, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].op, ChangeOp::Update);
        assert!(report.rejected[0].reason.contains("check constraint"));
        assert_eq!(store.pending_count(None).await.unwrap(), 0);

        let stored = remote.row(USER_PREFERENCES, "p1").unwrap();
        assert_eq!(stored["pace"], json!("one_chapter"));
        assert_eq!(stored["current_content_index"], json!(41));
        let local = store.get(USER_PREFERENCES, "p1").await.unwrap().unwrap();
        assert_eq!(local.str_field("pace"), Some("one_chapter"));
        assert_eq!(local.int_field("current_content_index"), Some(41));

        let audit = store.list_sync_conflicts(10).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].strategy, "rejected");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_remote_calls_time_out() {
        let remote = MemoryRemote::new();
        remote.set_latency(Some(Duration::from_millis(200)));
        let (store, push) = setup(
            &remote,
            SyncConfig::default().with_request_timeout(Duration::from_millis(20)),
        )
        .await;
        store
            .insert(USER_PREFERENCES, payload(json!({"id": "p1"})))
            .await
            .unwrap();

        let report = push.drain(None).await.unwrap();
        assert_eq!(report.failure.map(|error| error.kind), Some(RemoteErrorKind::Timeout));
        assert_eq!(store.pending_count(None).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn documents_push_concurrently_across_batches() {
        let remote = MemoryRemote::new();
        let (store, push) = setup(
            &remote,
            SyncConfig::default()
                .with_push_batch_size(3)
                .with_push_concurrency(2),
        )
        .await;
        for index in 0..7 {
            store
                .insert(
                    LEARNING_PATH,
                    payload(json!({"id": format!("n{index}"), "user_id": "u1", "node_index": index})),
                )
                .await
                .unwrap();
        }

        let report = push.drain(Some(LEARNING_PATH)).await.unwrap();
        assert_eq!(report.applied, 7);
        assert_eq!(remote.rows(LEARNING_PATH).len(), 7);
    }
}
