//! In-memory remote store with failure injection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value;

use super::{Precondition, RemoteError, RemoteQuery, RemoteResult, RemoteStore};
use crate::schema::{CollectionSchema, Row};

/// Seconds since the epoch of the first marker handed out.
const MARKER_EPOCH_SECS: i64 = 1_790_000_000;

/// A remote backend held in process memory.
///
/// Rows get a fresh `updated_at` marker on every write, the way the
/// server-side trigger stamps them. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, BTreeMap<String, Row>>,
    queued_failures: VecDeque<RemoteError>,
    outage: Option<RemoteError>,
    latency: Option<Duration>,
    clock: i64,
    calls: usize,
}

impl MemoryState {
    fn next_marker(&mut self) -> String {
        self.clock += 1;
        DateTime::from_timestamp(MARKER_EPOCH_SECS + self.clock, 0)
            .unwrap_or_default()
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }

    fn table(&mut self, name: &str) -> &mut BTreeMap<String, Row> {
        self.tables.entry(name.to_string()).or_default()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store rows as-is, stamping `updated_at` only where missing.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        let mut state = self.lock();
        for mut row in rows {
            let Some(id) = row_id(&row) else { continue };
            if !row.contains_key(CollectionSchema::MODIFIED_FIELD) {
                let marker = state.next_marker();
                row.insert(CollectionSchema::MODIFIED_FIELD.to_string(), Value::String(marker));
            }
            state.table(table).insert(id, row);
        }
    }

    /// Change a row out of band, as a server job or another device would.
    pub fn mutate(&self, table: &str, id: &str, patch: Row) -> Option<Row> {
        let mut state = self.lock();
        let marker = state.next_marker();
        let row = state.table(table).get_mut(id)?;
        row.extend(patch);
        row.insert(CollectionSchema::MODIFIED_FIELD.to_string(), Value::String(marker));
        Some(row.clone())
    }

    /// Delete a row out of band.
    pub fn remove(&self, table: &str, id: &str) -> Option<Row> {
        self.lock().table(table).remove(id)
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Row> {
        self.lock().table(table).get(id).cloned()
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock().table(table).values().cloned().collect()
    }

    /// Fail the next call with the given error.
    pub fn fail_next(&self, error: RemoteError) {
        self.lock().queued_failures.push_back(error);
    }

    /// Fail every call until cleared with `None`.
    pub fn set_outage(&self, error: Option<RemoteError>) {
        self.lock().outage = error;
    }

    /// Delay every call by the given duration.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Number of calls received so far.
    pub fn call_count(&self) -> usize {
        self.lock().calls
    }

    async fn enter(&self) -> RemoteResult<()> {
        let latency = {
            let mut state = self.lock();
            state.calls += 1;
            if let Some(error) = state.queued_failures.pop_front() {
                return Err(error);
            }
            if let Some(error) = state.outage.clone() {
                return Err(error);
            }
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

fn row_id(row: &Row) -> Option<String> {
    row.get(CollectionSchema::ID_FIELD)
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn select(&self, query: &RemoteQuery) -> RemoteResult<Vec<Row>> {
        self.enter().await?;
        let mut state = self.lock();
        let rows = state
            .table(&query.table)
            .iter()
            .filter(|(id, _)| {
                query
                    .after_id
                    .as_ref()
                    .map_or(true, |after| id.as_str() > after.as_str())
            })
            .filter(|(_, row)| query.filters.iter().all(|filter| filter.matches(row)))
            .take(query.limit)
            .map(|(_, row)| row.clone())
            .collect();
        Ok(rows)
    }

    async fn fetch(&self, table: &str, id: &str) -> RemoteResult<Option<Row>> {
        self.enter().await?;
        Ok(self.lock().table(table).get(id).cloned())
    }

    async fn insert(&self, table: &str, row: &Row) -> RemoteResult<Row> {
        self.enter().await?;
        let id = row_id(row)
            .ok_or_else(|| RemoteError::rejected("missing id"))?;
        let mut state = self.lock();
        if state.table(table).contains_key(&id) {
            return Err(RemoteError::duplicate_key(format!(
                "duplicate key value violates unique constraint \"{table}_pkey\" (23505)"
            )));
        }
        let marker = state.next_marker();
        let mut stored = row.clone();
        stored
            .entry(CollectionSchema::CREATED_FIELD.to_string())
            .or_insert_with(|| Value::String(marker.clone()));
        stored.insert(CollectionSchema::MODIFIED_FIELD.to_string(), Value::String(marker));
        state.table(table).insert(id, stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        row: &Row,
        precondition: Option<&Precondition>,
    ) -> RemoteResult<Option<Row>> {
        self.enter().await?;
        let mut state = self.lock();
        let marker = state.next_marker();
        let Some(existing) = state.table(table).get_mut(id) else {
            return Ok(None);
        };
        if let Some(precondition) = precondition {
            if existing.get(&precondition.field) != Some(&precondition.value) {
                return Ok(None);
            }
        }
        for (name, value) in row {
            if name != CollectionSchema::ID_FIELD {
                existing.insert(name.clone(), value.clone());
            }
        }
        existing.insert(CollectionSchema::MODIFIED_FIELD.to_string(), Value::String(marker));
        Ok(Some(existing.clone()))
    }

    async fn delete(&self, table: &str, id: &str) -> RemoteResult<bool> {
        self.enter().await?;
        Ok(self.lock().table(table).remove(id).is_some())
    }
}
