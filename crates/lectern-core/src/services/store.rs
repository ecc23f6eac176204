//! Local store handle shared by the replication engine and callers.
//!
//! All document, queue, checkpoint and meta writes go through here so the
//! ones that must be atomic share a single `SQLite` transaction.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use crate::db::{
    Database, DocumentRepository, NewChange, SqliteConflictRepository, SqliteDocumentRepository,
    SqliteMetaRepository, SqliteQueueRepository, REJECTED, REMOTE_WINS,
};
use crate::models::{
    new_document_id, ChangeEntry, ChangeOp, Checkpoint, ConflictRecord, Document, Payload,
    Preferences, SyncConflict,
};
use crate::schema::{self, carry_local_only, CollectionSchema, FieldRule, Scope, COLLECTIONS};
use crate::util::unix_millis_now;
use crate::window::Window;
use crate::{Error, Result};

const LOCAL_WRITE_CHANNEL_CAPACITY: usize = 64;

/// Outcome of committing one pulled page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCommit {
    pub written: usize,
    /// Rows skipped because the local document has unpushed changes
    pub skipped_pending: usize,
    /// Rows skipped because a conflict resolution landed after the fetch began
    pub skipped_fenced: usize,
}

/// Thread-safe handle to the local replica.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
    local_writes: broadcast::Sender<&'static str>,
}

impl LocalStore {
    /// Open the store at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::open(&db_path, COLLECTIONS)?;
        tracing::info!("Opened local store at {}", db_path.display());
        Ok(Self::from_database(db, Some(db_path)))
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory(COLLECTIONS)?;
        Ok(Self::from_database(db, None))
    }

    fn from_database(db: Database, db_path: Option<PathBuf>) -> Self {
        let (local_writes, _) = broadcast::channel(LOCAL_WRITE_CHANNEL_CAPACITY);
        Self {
            db: Arc::new(Mutex::new(db)),
            db_path,
            local_writes,
        }
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Collection names of local writes, as they happen.
    pub fn subscribe_local_writes(&self) -> broadcast::Receiver<&'static str> {
        self.local_writes.subscribe()
    }

    pub(crate) fn announce_local_write(&self, collection: &'static str) {
        // No subscribers just means nothing is replicating yet
        self.local_writes.send(collection).ok();
    }

    // Reads

    /// A live document by ID.
    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        Ok(self
            .get_including_deleted(collection, id)
            .await?
            .filter(|doc| !doc.deleted))
    }

    pub async fn get_including_deleted(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>> {
        let schema = schema::collection(collection)?;
        let db = self.db.lock().await;
        SqliteDocumentRepository::new(db.connection(), schema).get(id)
    }

    /// Live documents ordered by ID.
    pub async fn list(&self, collection: &str) -> Result<Vec<Document>> {
        let schema = schema::collection(collection)?;
        let db = self.db.lock().await;
        SqliteDocumentRepository::new(db.connection(), schema).list(false)
    }

    /// First live document whose field equals the value.
    pub async fn find_one(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Option<Document>> {
        Ok(self
            .list(collection)
            .await?
            .into_iter()
            .find(|doc| doc.payload.get(field) == Some(value)))
    }

    /// Position and pace from the local preferences document.
    pub async fn preferences(&self, user_id: &str) -> Result<Preferences> {
        let prefs = schema::collection(schema::registry::USER_PREFERENCES)?;
        let doc = match prefs.scope {
            Scope::Owner { field } => {
                self.find_one(prefs.name, field, &Value::String(user_id.to_string()))
                    .await?
            }
            Scope::Broadcast => self.list(prefs.name).await?.into_iter().next(),
        };
        Ok(Preferences::from_document(doc.as_ref()))
    }

    // Local writes

    /// Create a document and queue its insert.
    ///
    /// Uses `payload["id"]` when present, otherwise a new time-ordered ID.
    pub async fn insert(&self, collection: &str, mut payload: Payload) -> Result<Document> {
        let schema = writable(collection)?;
        let id = match payload.remove(CollectionSchema::ID_FIELD) {
            Some(Value::String(id)) if !id.trim().is_empty() => id,
            Some(other) if !other.is_null() => {
                return Err(Error::InvalidInput(format!("id must be a string, got {other}")))
            }
            _ => new_document_id(),
        };
        let doc = Document::new(id, payload);

        {
            let mut db = self.db.lock().await;
            let tx = db.connection_mut().transaction()?;
            let docs = SqliteDocumentRepository::new(&tx, schema);
            if docs.get(&doc.id)?.is_some() {
                return Err(Error::InvalidInput(format!(
                    "{collection} document {} already exists",
                    doc.id
                )));
            }
            let now = unix_millis_now();
            docs.put(&doc, now)?;
            SqliteQueueRepository::new(&tx).enqueue(
                NewChange {
                    collection: schema.name,
                    op: ChangeOp::Insert,
                    doc_id: &doc.id,
                    payload: &doc.payload,
                    assumed_modified: None,
                },
                now,
            )?;
            tx.commit()?;
        }

        tracing::debug!("Queued insert of {}/{}", schema.name, doc.id);
        self.announce_local_write(schema.name);
        Ok(doc)
    }

    /// Merge fields into a live document and queue its update.
    ///
    /// The queued payload holds only the patched synced fields, so a later
    /// entry never re-sends fields an earlier conflict resolved. Patches that
    /// only touch local-only fields are not queued.
    pub async fn update(&self, collection: &str, id: &str, patch: Payload) -> Result<Document> {
        let schema = writable(collection)?;
        let changes: Payload = patch
            .iter()
            .filter(|(name, _)| {
                name.as_str() != CollectionSchema::ID_FIELD
                    && schema.rule(name) != FieldRule::LocalOnly
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let syncs = !changes.is_empty();

        let doc = {
            let mut db = self.db.lock().await;
            let tx = db.connection_mut().transaction()?;
            let docs = SqliteDocumentRepository::new(&tx, schema);
            let mut doc = docs
                .get(id)?
                .filter(|doc| !doc.deleted)
                .ok_or_else(|| Error::NotFound(format!("{collection}/{id}")))?;
            for (name, value) in patch {
                if name != CollectionSchema::ID_FIELD {
                    doc.payload.insert(name, value);
                }
            }
            let now = unix_millis_now();
            docs.put(&doc, now)?;
            if syncs {
                SqliteQueueRepository::new(&tx).enqueue(
                    NewChange {
                        collection: schema.name,
                        op: ChangeOp::Update,
                        doc_id: &doc.id,
                        payload: &changes,
                        assumed_modified: doc.modified.as_deref(),
                    },
                    now,
                )?;
            }
            tx.commit()?;
            doc
        };

        if syncs {
            tracing::debug!("Queued update of {}/{}", schema.name, doc.id);
            self.announce_local_write(schema.name);
        }
        Ok(doc)
    }

    /// Tombstone a document and queue its remote delete.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let schema = writable(collection)?;
        {
            let mut db = self.db.lock().await;
            let tx = db.connection_mut().transaction()?;
            let docs = SqliteDocumentRepository::new(&tx, schema);
            let mut doc = docs
                .get(id)?
                .ok_or_else(|| Error::NotFound(format!("{collection}/{id}")))?;
            if doc.deleted {
                return Ok(());
            }
            doc.deleted = true;
            let now = unix_millis_now();
            docs.put(&doc, now)?;
            SqliteQueueRepository::new(&tx).enqueue(
                NewChange {
                    collection: schema.name,
                    op: ChangeOp::Delete,
                    doc_id: &doc.id,
                    payload: &doc.payload,
                    assumed_modified: doc.modified.as_deref(),
                },
                now,
            )?;
            tx.commit()?;
        }

        tracing::debug!("Queued delete of {}/{id}", schema.name);
        self.announce_local_write(schema.name);
        Ok(())
    }

    // Change queue

    /// Oldest pending entries, optionally for one collection.
    pub async fn pending_changes(
        &self,
        collection: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChangeEntry>> {
        let db = self.db.lock().await;
        SqliteQueueRepository::new(db.connection()).pending(collection, limit)
    }

    pub async fn pending_count(&self, collection: Option<&str>) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteQueueRepository::new(db.connection()).count(collection)
    }

    pub async fn has_pending(&self, collection: &str, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteQueueRepository::new(db.connection()).has_pending(collection, id)
    }

    /// Remove an entry the remote acknowledged.
    ///
    /// When the remote returned its stored row and no later entries for the
    /// document remain, the local document becomes that row; otherwise it only
    /// adopts the row's marker and later entries are rebased onto it. Returns
    /// false when the entry had already been removed.
    pub async fn acknowledge(&self, entry: &ChangeEntry, remote: Option<&Document>) -> Result<bool> {
        let schema = schema::collection(&entry.collection)?;
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let queue = SqliteQueueRepository::new(&tx);
        if !queue.remove(entry.seq)? {
            return Ok(false);
        }
        if let Some(remote) = remote.filter(|_| entry.op != ChangeOp::Delete) {
            let docs = SqliteDocumentRepository::new(&tx, schema);
            let existing = docs.get(&entry.doc_id)?.filter(|doc| !doc.deleted);
            match existing {
                Some(existing) if !queue.has_pending(schema.name, &entry.doc_id)? => {
                    let mut stored = remote.clone();
                    carry_local_only(schema, &existing.payload, &mut stored.payload);
                    docs.put(&stored, unix_millis_now())?;
                    // Older pull pages in flight must not undo the acknowledged row
                    let rev = SqliteMetaRepository::new(&tx).tick_conflict_clock()?;
                    docs.set_conflict_rev(&stored.id, rev)?;
                }
                _ => docs.set_modified(&entry.doc_id, remote.modified.as_deref())?,
            }
            queue.rebase(
                schema.name,
                &entry.doc_id,
                entry.seq,
                remote.modified.as_deref(),
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    pub async fn record_push_failure(&self, entry: &ChangeEntry, error: &str) -> Result<()> {
        let db = self.db.lock().await;
        SqliteQueueRepository::new(db.connection()).record_failure(entry.seq, error)
    }

    /// Resolve a write that failed its precondition with the remote's state.
    ///
    /// Removes the entry, overwrites or drops the local document, stamps it
    /// with a fresh conflict clock value and rebases later entries.
    pub async fn apply_conflict(&self, entry: &ChangeEntry, conflict: &ConflictRecord) -> Result<()> {
        self.resolve_remote_wins(entry, conflict, REMOTE_WINS).await
    }

    /// Drop an entry the remote refused and fall back to the remote's state.
    ///
    /// Same resolution as [`Self::apply_conflict`], audited as `rejected`.
    pub async fn apply_rejection(&self, entry: &ChangeEntry, remote: &ConflictRecord) -> Result<()> {
        self.resolve_remote_wins(entry, remote, REJECTED).await
    }

    async fn resolve_remote_wins(
        &self,
        entry: &ChangeEntry,
        conflict: &ConflictRecord,
        strategy: &str,
    ) -> Result<()> {
        let schema = schema::collection(&conflict.collection)?;
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let queue = SqliteQueueRepository::new(&tx);
        if !queue.remove(entry.seq)? {
            return Ok(());
        }
        let docs = SqliteDocumentRepository::new(&tx, schema);
        let meta = SqliteMetaRepository::new(&tx);
        let now = unix_millis_now();
        match &conflict.remote {
            Some(remote) => {
                let mut resolved = remote.clone();
                if let Some(existing) = docs.get(&conflict.doc_id)? {
                    carry_local_only(schema, &existing.payload, &mut resolved.payload);
                }
                docs.put(&resolved, now)?;
                docs.set_conflict_rev(&resolved.id, meta.tick_conflict_clock()?)?;
            }
            None => {
                docs.remove(&conflict.doc_id)?;
                meta.tick_conflict_clock()?;
            }
        }
        queue.rebase(
            schema.name,
            &conflict.doc_id,
            entry.seq,
            conflict.remote_modified(),
        )?;
        SqliteConflictRepository::new(&tx).record(conflict, strategy, now)?;
        tx.commit()?;
        Ok(())
    }

    // Pull bookkeeping

    pub async fn checkpoint(&self, collection: &str) -> Result<Option<Checkpoint>> {
        let db = self.db.lock().await;
        SqliteMetaRepository::new(db.connection()).checkpoint(collection)
    }

    /// Forget a collection's cursor; documents stay.
    pub async fn reset_checkpoint(&self, collection: &str) -> Result<()> {
        let db = self.db.lock().await;
        SqliteMetaRepository::new(db.connection()).clear_checkpoint(collection)
    }

    /// Conflict clock value to fence a pull page fetched from now on.
    pub async fn conflict_fence(&self) -> Result<i64> {
        let db = self.db.lock().await;
        SqliteMetaRepository::new(db.connection()).conflict_clock()
    }

    /// Write a pulled page and its checkpoint in one transaction.
    ///
    /// The stored checkpoint never moves backwards within a window; a cursor
    /// behind it (from a restarted sweep) is not saved.
    /// Documents with pending queue entries keep their local state, and so
    /// do documents resolved by a conflict after `fence` was read.
    pub async fn commit_pull_page(
        &self,
        schema: &CollectionSchema,
        documents: &[Document],
        checkpoint: Option<&Checkpoint>,
        fence: i64,
    ) -> Result<PageCommit> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let pending = SqliteQueueRepository::new(&tx).pending_doc_ids(schema.name)?;
        let docs = SqliteDocumentRepository::new(&tx, schema);
        let now = unix_millis_now();
        let mut outcome = PageCommit::default();

        for doc in documents {
            if pending.contains(&doc.id) {
                outcome.skipped_pending += 1;
                continue;
            }
            if docs.conflict_rev(&doc.id)? > fence {
                outcome.skipped_fenced += 1;
                continue;
            }
            let mut incoming = doc.clone();
            incoming.deleted = false;
            if let Some(existing) = docs.get(&doc.id)? {
                carry_local_only(schema, &existing.payload, &mut incoming.payload);
            }
            docs.put(&incoming, now)?;
            outcome.written += 1;
        }

        if let Some(checkpoint) = checkpoint {
            let meta = SqliteMetaRepository::new(&tx);
            if checkpoint.supersedes(meta.checkpoint(schema.name)?.as_ref()) {
                meta.save_checkpoint(checkpoint)?;
            }
        }
        tx.commit()?;
        Ok(outcome)
    }

    /// Physically remove documents outside the window and settled tombstones.
    ///
    /// Documents with pending queue entries are never removed.
    pub async fn prune(&self, schema: &CollectionSchema, window: &Window) -> Result<usize> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let pending = SqliteQueueRepository::new(&tx).pending_doc_ids(schema.name)?;
        let docs = SqliteDocumentRepository::new(&tx, schema);
        let mut removed = 0;
        for doc in docs.list(true)? {
            if pending.contains(&doc.id) {
                continue;
            }
            if (doc.deleted || !window.contains(&doc)) && docs.remove(&doc.id)? {
                removed += 1;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    /// When any collection last completed a pull cycle.
    pub async fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>> {
        let db = self.db.lock().await;
        let raw = SqliteMetaRepository::new(db.connection()).last_sync_at()?;
        Ok(raw
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|at| at.with_timezone(&Utc)))
    }

    pub async fn record_sync_completed(&self, at: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock().await;
        SqliteMetaRepository::new(db.connection()).set_last_sync_at(&at.to_rfc3339())
    }

    // Legacy import

    pub async fn legacy_import_complete(&self) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteMetaRepository::new(db.connection()).legacy_import_complete()
    }

    pub async fn mark_legacy_import_complete(&self) -> Result<()> {
        let db = self.db.lock().await;
        SqliteMetaRepository::new(db.connection()).mark_legacy_import_complete()
    }

    /// Store imported documents as already synced and set the import flag.
    ///
    /// Existing documents are left untouched. Returns how many were written.
    pub async fn import_documents(
        &self,
        batches: &[(&CollectionSchema, Vec<Document>)],
    ) -> Result<usize> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let now = unix_millis_now();
        let mut written = 0;
        for (schema, documents) in batches {
            let docs = SqliteDocumentRepository::new(&tx, schema);
            for doc in documents {
                if docs.insert_if_absent(doc, now)? {
                    written += 1;
                }
            }
        }
        SqliteMetaRepository::new(&tx).mark_legacy_import_complete()?;
        tx.commit()?;
        Ok(written)
    }

    // Conflicts

    pub async fn list_sync_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        SqliteConflictRepository::new(db.connection()).list(limit)
    }
}

fn writable(collection: &str) -> Result<&'static CollectionSchema> {
    let schema = schema::collection(collection)?;
    if schema.read_only {
        return Err(Error::ReadOnlyCollection(collection.to_string()));
    }
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::registry::{CONTENT_CACHE, LEARNING_PATH, USER_PREFERENCES};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::tempdir;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn node(id: &str, index: i64) -> Document {
        Document::new(id, payload(json!({"user_id": "u1", "node_index": index})))
            .with_modified(format!("m-{id}"))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_writes_enqueue_changes_atomically() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let mut writes = store.subscribe_local_writes();

        let doc = store
            .insert(
                USER_PREFERENCES,
                payload(json!({"user_id": "u1", "pace": "one_chapter"})),
            )
            .await
            .unwrap();
        store
            .update(USER_PREFERENCES, &doc.id, payload(json!({"pace": "two_mishna"})))
            .await
            .unwrap();
        store.delete(USER_PREFERENCES, &doc.id).await.unwrap();

        let ops: Vec<_> = store
            .pending_changes(Some(USER_PREFERENCES), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.op)
            .collect();
        assert_eq!(ops, vec![ChangeOp::Insert, ChangeOp::Update, ChangeOp::Delete]);
        assert!(store.get(USER_PREFERENCES, &doc.id).await.unwrap().is_none());
        assert!(store
            .get_including_deleted(USER_PREFERENCES, &doc.id)
            .await
            .unwrap()
            .unwrap()
            .deleted);
        assert_eq!(writes.recv().await.unwrap(), USER_PREFERENCES);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn read_only_collections_reject_local_writes() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let result = store.insert(CONTENT_CACHE, Payload::new()).await;
        assert!(matches!(result, Err(Error::ReadOnlyCollection(_))));
        assert!(matches!(
            store.insert("notes", Payload::new()).await,
            Err(Error::UnknownCollection(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_only_patches_are_not_queued() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let doc = store
            .insert(USER_PREFERENCES, payload(json!({"id": "p1", "user_id": "u1"})))
            .await
            .unwrap();
        assert_eq!(doc.id, "p1");
        store
            .update(
                USER_PREFERENCES,
                "p1",
                payload(json!({"yom_tov_dates": ["2026-10-03"]})),
            )
            .await
            .unwrap();
        assert_eq!(store.pending_count(Some(USER_PREFERENCES)).await.unwrap(), 1);
        assert!(store
            .get(USER_PREFERENCES, "p1")
            .await
            .unwrap()
            .unwrap()
            .field("yom_tov_dates")
            .is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_ids_and_missing_documents_are_rejected() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .insert(USER_PREFERENCES, payload(json!({"id": "p1"})))
            .await
            .unwrap();
        assert!(matches!(
            store.insert(USER_PREFERENCES, payload(json!({"id": "p1"}))).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            store.update(USER_PREFERENCES, "nope", Payload::new()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pull_pages_skip_documents_with_pending_changes() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let schema = schema::collection(LEARNING_PATH).unwrap();
        store
            .insert(LEARNING_PATH, payload(json!({"id": "n1", "node_index": 1})))
            .await
            .unwrap();

        let checkpoint = Checkpoint {
            collection: LEARNING_PATH.to_string(),
            last_seen_id: "n2".to_string(),
            last_seen_modified: Some("m-n2".to_string()),
            window_key: "all".to_string(),
        };
        let outcome = store
            .commit_pull_page(schema, &[node("n1", 9), node("n2", 2)], Some(&checkpoint), 0)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            PageCommit {
                written: 1,
                skipped_pending: 1,
                skipped_fenced: 0
            }
        );
        assert_eq!(
            store
                .get(LEARNING_PATH, "n1")
                .await
                .unwrap()
                .unwrap()
                .int_field("node_index"),
            Some(1)
        );
        assert_eq!(store.checkpoint(LEARNING_PATH).await.unwrap(), Some(checkpoint));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflicts_fence_older_pull_pages() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let schema = schema::collection(USER_PREFERENCES).unwrap();
        store
            .insert(USER_PREFERENCES, payload(json!({"id": "p1", "pace": "one_chapter"})))
            .await
            .unwrap();
        let entry = store
            .pending_changes(Some(USER_PREFERENCES), 1)
            .await
            .unwrap()
            .remove(0);

        let fence = store.conflict_fence().await.unwrap();
        let winner = Document::new("p1", payload(json!({"pace": "two_mishna"}))).with_modified("m9");
        store
            .apply_conflict(
                &entry,
                &ConflictRecord {
                    collection: USER_PREFERENCES.to_string(),
                    doc_id: "p1".to_string(),
                    assumed_modified: None,
                    remote: Some(winner.clone()),
                },
            )
            .await
            .unwrap();

        let stale = Document::new("p1", payload(json!({"pace": "seder_per_year"}))).with_modified("m8");
        let outcome = store
            .commit_pull_page(schema, &[stale], None, fence)
            .await
            .unwrap();
        assert_eq!(outcome.skipped_fenced, 1);
        assert_eq!(store.get(USER_PREFERENCES, "p1").await.unwrap(), Some(winner));
        assert_eq!(store.pending_count(None).await.unwrap(), 0);
        assert_eq!(store.list_sync_conflicts(10).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn acknowledge_adopts_marker_and_rebases_later_entries() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .insert(USER_PREFERENCES, payload(json!({"id": "p1", "pace": "one_chapter"})))
            .await
            .unwrap();
        store
            .update(USER_PREFERENCES, "p1", payload(json!({"pace": "two_mishna"})))
            .await
            .unwrap();
        let entries = store.pending_changes(None, 10).await.unwrap();

        let stored = Document::new("p1", Payload::new()).with_modified("m1");
        assert!(store.acknowledge(&entries[0], Some(&stored)).await.unwrap());
        assert!(!store.acknowledge(&entries[0], Some(&stored)).await.unwrap());

        let remaining = store.pending_changes(None, 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].assumed_modified.as_deref(), Some("m1"));
        assert_eq!(
            store
                .get(USER_PREFERENCES, "p1")
                .await
                .unwrap()
                .unwrap()
                .modified
                .as_deref(),
            Some("m1")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn last_acknowledgement_adopts_stored_row() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .insert(
                USER_PREFERENCES,
                payload(json!({"id": "p1", "pace": "one_chapter", "yom_tov_dates": []})),
            )
            .await
            .unwrap();
        let entry = store.pending_changes(None, 1).await.unwrap().remove(0);
        assert_eq!(entry.payload.get("pace"), Some(&json!("one_chapter")));

        let stored = Document::new(
            "p1",
            payload(json!({"pace": "one_chapter", "created_at": "2026-10-16T08:00:00Z"})),
        )
        .with_modified("m1");
        store.acknowledge(&entry, Some(&stored)).await.unwrap();

        let local = store.get(USER_PREFERENCES, "p1").await.unwrap().unwrap();
        assert_eq!(local.modified.as_deref(), Some("m1"));
        assert!(local.field("created_at").is_some());
        assert!(local.payload.contains_key("yom_tov_dates"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn updates_queue_only_the_patched_fields() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .insert(USER_PREFERENCES, payload(json!({"id": "p1", "pace": "one_chapter"})))
            .await
            .unwrap();
        store
            .update(
                USER_PREFERENCES,
                "p1",
                payload(json!({"current_content_index": 3, "yom_tov_dates": []})),
            )
            .await
            .unwrap();
        let update = store.pending_changes(None, 10).await.unwrap().remove(1);
        assert_eq!(update.payload, payload(json!({"current_content_index": 3})));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn prune_keeps_pending_and_in_window_documents() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let schema = schema::collection(LEARNING_PATH).unwrap();
        store
            .commit_pull_page(
                schema,
                &[node("a", 25), node("b", 40), node("c", 10)],
                None,
                0,
            )
            .await
            .unwrap();
        store
            .update(LEARNING_PATH, "c", payload(json!({"completed_at": "2026-10-16"})))
            .await
            .unwrap();

        let window = Window::Position {
            field: "node_index",
            start: 26,
            end: 70,
        };
        assert_eq!(store.prune(schema, &window).await.unwrap(), 1);
        let ids: Vec<_> = store
            .list(LEARNING_PATH)
            .await
            .unwrap()
            .into_iter()
            .map(|doc| doc.id)
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn preferences_default_to_position_zero() {
        let store = LocalStore::open_in_memory().await.unwrap();
        assert_eq!(store.preferences("u1").await.unwrap(), Preferences::default());

        store
            .insert(
                USER_PREFERENCES,
                payload(json!({"user_id": "u1", "current_content_index": 40})),
            )
            .await
            .unwrap();
        assert_eq!(store.preferences("u1").await.unwrap().position, 40);
        assert_eq!(store.preferences("u2").await.unwrap().position, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queue_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("lectern.db");
        {
            let store = LocalStore::open_path(&path).await.unwrap();
            store
                .insert(USER_PREFERENCES, payload(json!({"id": "p1"})))
                .await
                .unwrap();
        }
        let store = LocalStore::open_path(&path).await.unwrap();
        assert_eq!(store.pending_count(None).await.unwrap(), 1);
        assert_eq!(store.db_path(), Some(path.as_path()));
    }
}
