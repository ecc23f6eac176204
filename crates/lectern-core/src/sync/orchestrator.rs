//! Replication orchestrator.
//!
//! Runs one task per collection that moves through
//! `stopped -> initializing -> steady-state <-> paused`, reacting to a
//! periodic timer, local writes and lifecycle signals. Callers get status
//! through watch channels, events through a broadcast channel, and a few
//! awaitable primitives: the initial-replication barrier, the next pull
//! cycle, and a manual push-then-pull round.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Interval;

use super::gaps::ContentGapListener;
use super::legacy::{import_legacy, LegacyImporter};
use super::pull::{PullCycle, PullEngine, PullMode};
use super::push::{PushEngine, PushReport};
use super::{CollectionStatus, ReplicationPhase, SyncEvent, SyncReport, SyncState};
use crate::config::SyncConfig;
use crate::remote::RemoteStore;
use crate::schema::{self, registry::USER_PREFERENCES, CollectionSchema, WindowSpec, COLLECTIONS};
use crate::services::LocalStore;
use crate::{Error, Result};

/// Source of "today" for date windows.
pub type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

const COMMAND_CAPACITY: usize = 8;
const EVENT_CAPACITY: usize = 256;
const STALE_AFTER_SECS: i64 = 6 * 60 * 60;

/// Whether a sync is due: never synced, a new calendar day, or over six hours.
pub fn needs_sync<Tz: TimeZone>(last_sync: Option<&DateTime<Tz>>, now: &DateTime<Tz>) -> bool {
    let Some(last) = last_sync else {
        return true;
    };
    last.date_naive() != now.date_naive() || now.timestamp() - last.timestamp() > STALE_AFTER_SECS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Push,
    /// Push, then pull
    Cycle(PullMode),
    /// Connectivity came back; also leaves `paused`
    Resume,
}

struct CollectionHandle {
    pull: PullEngine,
    status: watch::Sender<CollectionStatus>,
    commands: mpsc::Sender<Command>,
    pull_lock: Mutex<()>,
    push_lock: Mutex<()>,
}

impl CollectionHandle {
    const fn schema(&self) -> &'static CollectionSchema {
        self.pull.schema()
    }
}

struct Shared {
    store: LocalStore,
    push: PushEngine,
    config: Arc<SyncConfig>,
    clock: Clock,
    collections: Vec<CollectionHandle>,
    events: broadcast::Sender<SyncEvent>,
    gap_listener: Option<Arc<dyn ContentGapListener>>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn status(&self, idx: usize) -> CollectionStatus {
        self.collections[idx].status.borrow().clone()
    }

    fn emit(&self, event: SyncEvent) {
        // Nobody listening is fine
        self.events.send(event).ok();
    }

    fn update_status(&self, idx: usize, change: impl FnOnce(&mut CollectionStatus)) {
        let handle = &self.collections[idx];
        let changed = handle.status.send_if_modified(|status| {
            let before = status.clone();
            change(status);
            *status != before
        });
        if changed {
            self.emit(SyncEvent::StatusChanged {
                collection: handle.schema().name,
                status: self.status(idx),
            });
        }
    }

    fn mark_syncing(&self, idx: usize) {
        self.update_status(idx, |status| {
            if status.phase != ReplicationPhase::Stopped {
                status.state = SyncState::Syncing;
            }
        });
    }

    /// Record a failed cycle; fatal remote errors stop the collection.
    fn record_failure(&self, idx: usize, error: &Error) {
        let name = self.collections[idx].schema().name;
        let (fatal, retryable) = match error {
            Error::Remote(remote) => (remote.is_fatal(), remote.is_retryable()),
            _ => (false, false),
        };
        let pause_after = self.config.pause_after_failures.max(1);
        self.update_status(idx, |status| {
            status.last_error = Some(error.to_string());
            if fatal {
                status.phase = ReplicationPhase::Stopped;
                status.state = SyncState::Error;
                return;
            }
            status.consecutive_failures += 1;
            status.state = if retryable {
                SyncState::Offline
            } else {
                SyncState::Error
            };
            if status.consecutive_failures >= pause_after && status.phase != ReplicationPhase::Stopped
            {
                status.phase = ReplicationPhase::Paused;
            }
        });
        if fatal {
            tracing::error!("Replication of {name} stopped: {error}");
        } else {
            tracing::warn!("Sync cycle for {name} failed: {error}");
        }
        self.emit(SyncEvent::CycleFailed {
            collection: name,
            error: error.to_string(),
        });
    }

    async fn pull_cycle(&self, idx: usize, mode: PullMode) -> Result<PullCycle> {
        let handle = &self.collections[idx];
        let _guard = handle.pull_lock.lock().await;
        self.mark_syncing(idx);

        let cycle = match handle.pull.run_cycle((self.clock)(), mode).await {
            Ok(cycle) => cycle,
            Err(error) => {
                self.record_failure(idx, &error);
                return Err(error);
            }
        };

        if let Some(gaps) = cycle.gaps.as_ref().filter(|gaps| !gaps.is_empty()) {
            tracing::info!("{} content gap(s) in {}", gaps.indexes().len(), gaps.collection);
            if let Some(listener) = &self.gap_listener {
                listener.on_content_gaps(gaps);
            }
            self.emit(SyncEvent::ContentGaps(gaps.clone()));
        }

        let now = Utc::now();
        self.store.record_sync_completed(now).await?;
        self.update_status(idx, |status| {
            status.pull_cycles += 1;
            status.last_pull_at = Some(now);
            status.consecutive_failures = 0;
            status.last_error = None;
            status.state = SyncState::Synced;
            status.initial_replication_done = true;
            if matches!(
                status.phase,
                ReplicationPhase::Initializing | ReplicationPhase::Paused
            ) {
                status.phase = ReplicationPhase::SteadyState;
            }
        });
        Ok(cycle)
    }

    async fn push_cycle(&self, idx: usize) -> Result<PushReport> {
        let handle = &self.collections[idx];
        let schema = handle.schema();
        if schema.read_only {
            return Ok(PushReport::default());
        }
        let _guard = handle.push_lock.lock().await;
        if self.store.pending_count(Some(schema.name)).await? == 0 {
            return Ok(PushReport::default());
        }
        self.mark_syncing(idx);

        let report = match self.push.drain(Some(schema.name)).await {
            Ok(report) => report,
            Err(error) => {
                self.record_failure(idx, &error);
                return Err(error);
            }
        };
        for conflict in &report.conflicts {
            self.emit(SyncEvent::ConflictResolved(conflict.clone()));
        }
        for rejected in &report.rejected {
            self.emit(SyncEvent::CycleFailed {
                collection: schema.name,
                error: format!(
                    "{} {} rejected: {}",
                    rejected.op, rejected.resolution.doc_id, rejected.reason
                ),
            });
        }
        match &report.failure {
            Some(failure) => self.record_failure(idx, &Error::Remote(failure.clone())),
            None => self.update_status(idx, |status| {
                if status.initial_replication_done && status.phase != ReplicationPhase::Stopped {
                    status.state = SyncState::Synced;
                }
            }),
        }
        Ok(report)
    }

    /// One manual round for a collection: drain its queue, then a restarted pull.
    async fn sync_round(&self, idx: usize) -> Result<SyncReport> {
        let status = self.status(idx);
        if status.phase == ReplicationPhase::Stopped {
            return Err(Error::ReplicationStopped {
                collection: self.collections[idx].schema().name.to_string(),
                reason: status.last_error.unwrap_or_else(|| "not running".to_string()),
            });
        }
        let pushed = self.push_cycle(idx).await?;
        if let Some(failure) = pushed.failure {
            return Err(Error::Remote(failure));
        }
        let pulled = self.pull_cycle(idx, PullMode::Restart).await?;
        Ok(SyncReport {
            pushed: pushed.applied,
            conflicts: pushed.conflicts.len(),
            rejected: pushed.rejected.len(),
            pulled: pulled.written,
            pruned: pulled.pruned,
        })
    }

    async fn run_command(&self, idx: usize, command: Command) {
        // Failures are recorded in the collection status
        match command {
            Command::Push => {
                self.push_cycle(idx).await.ok();
            }
            Command::Cycle(mode) => {
                self.push_cycle(idx).await.ok();
                self.pull_cycle(idx, mode).await.ok();
            }
            Command::Resume => {
                if self.push_cycle(idx).await.is_ok() {
                    self.pull_cycle(idx, PullMode::Incremental).await.ok();
                }
            }
        }
    }

    fn broadcast(&self, command: Command) {
        for handle in &self.collections {
            // A full queue already holds a pending cycle
            handle.commands.try_send(command).ok();
        }
    }

    fn index_of(&self, collection: &str) -> Result<usize> {
        self.collections
            .iter()
            .position(|handle| handle.schema().name == collection)
            .ok_or_else(|| Error::UnknownCollection(collection.to_string()))
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Position windows read the local preferences, so they wait for its first pull.
async fn wait_for_preferences(shared: &Shared, idx: usize) {
    if !matches!(shared.collections[idx].schema().window, WindowSpec::Position { .. }) {
        return;
    }
    let Ok(prefs) = shared.index_of(USER_PREFERENCES) else {
        return;
    };
    let mut status = shared.collections[prefs].status.subscribe();
    status
        .wait_for(|status| status.initial_replication_done || status.phase != ReplicationPhase::Initializing)
        .await
        .ok();
}

async fn run_collection(shared: Arc<Shared>, idx: usize, mut commands: mpsc::Receiver<Command>) {
    let schema = shared.collections[idx].schema();
    let mut shutdown = shared.shutdown.subscribe();
    let mut writes = shared.store.subscribe_local_writes();
    let follows_preferences = matches!(schema.window, WindowSpec::Position { .. });

    tokio::select! {
        _ = shutdown.wait_for(|stop| *stop) => return,
        () = wait_for_preferences(&shared, idx) => {}
    }

    let mut attempt = 0;
    loop {
        let delay = shared.config.retry.delay_for_attempt(attempt);
        let outcome = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return,
            outcome = async {
                tokio::time::sleep(delay).await;
                shared.pull_cycle(idx, PullMode::Incremental).await
            } => outcome,
        };
        if outcome.is_ok() || shared.status(idx).phase != ReplicationPhase::Initializing {
            break;
        }
        attempt += 1;
    }
    if shared.status(idx).phase == ReplicationPhase::SteadyState {
        tracing::info!("Initial replication of {} complete", schema.name);
        // The queue may still hold writes from an earlier session
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return,
            () = shared.run_command(idx, Command::Push) => {}
        }
    }

    let mut ticker = match shared.config.sync_interval {
        Some(period) => {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            Some(ticker)
        }
        None => None,
    };

    loop {
        let phase = shared.status(idx).phase;
        if phase == ReplicationPhase::Stopped {
            break;
        }
        let paused = phase == ReplicationPhase::Paused;
        let command = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
            write = writes.recv(), if !paused => match write {
                Ok(collection) if collection == schema.name => Command::Push,
                Ok(collection) if follows_preferences && collection == USER_PREFERENCES => {
                    Command::Cycle(PullMode::Incremental)
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => Command::Push,
                Err(RecvError::Closed) => break,
            },
            () = tick(&mut ticker), if !paused => Command::Cycle(PullMode::Incremental),
        };
        if paused && !matches!(command, Command::Resume | Command::Cycle(PullMode::Restart)) {
            continue;
        }
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            () = shared.run_command(idx, command) => {}
        }
    }
    tracing::debug!("Replication task for {} exited", schema.name);
}

/// Handle to running replication for one principal.
pub struct Replicator {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Replicator {
    pub fn builder(
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        principal: impl Into<String>,
    ) -> ReplicatorBuilder {
        ReplicatorBuilder {
            store,
            remote,
            principal: principal.into(),
            config: SyncConfig::default(),
            clock: None,
            gap_listener: None,
            legacy_importer: None,
            collections: None,
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.shared.store
    }

    pub fn collections(&self) -> Vec<&'static str> {
        self.shared
            .collections
            .iter()
            .map(|handle| handle.schema().name)
            .collect()
    }

    pub fn status(&self, collection: &str) -> Result<CollectionStatus> {
        Ok(self.shared.status(self.shared.index_of(collection)?))
    }

    pub fn statuses(&self) -> Vec<(&'static str, CollectionStatus)> {
        self.shared
            .collections
            .iter()
            .map(|handle| (handle.schema().name, handle.status.borrow().clone()))
            .collect()
    }

    /// Aggregate state for a single status indicator.
    pub fn sync_state(&self) -> SyncState {
        SyncState::aggregate(
            self.shared
                .collections
                .iter()
                .map(|handle| handle.status.borrow().state),
        )
    }

    pub fn subscribe_status(&self, collection: &str) -> Result<watch::Receiver<CollectionStatus>> {
        let idx = self.shared.index_of(collection)?;
        Ok(self.shared.collections[idx].status.subscribe())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    async fn wait_for_status(
        &self,
        idx: usize,
        mut done: impl FnMut(&CollectionStatus) -> bool,
    ) -> Result<CollectionStatus> {
        let mut status = self.shared.collections[idx].status.subscribe();
        let mut shutdown = self.shared.shutdown.subscribe();
        tokio::select! {
            reached = status.wait_for(|status| done(status) || status.phase == ReplicationPhase::Stopped) => {
                reached.map(|status| status.clone()).map_err(|_| Error::Cancelled)
            }
            _ = shutdown.wait_for(|stop| *stop) => Err(Error::Cancelled),
        }
    }

    /// Wait until every collection has completed its first full pull.
    ///
    /// Fails when a collection stops first. Paused collections keep this
    /// waiting until connectivity is restored.
    pub async fn await_initial_replication(&self) -> Result<()> {
        for (idx, handle) in self.shared.collections.iter().enumerate() {
            let status = self
                .wait_for_status(idx, |status| status.initial_replication_done)
                .await?;
            if !status.initial_replication_done {
                return Err(Error::ReplicationStopped {
                    collection: handle.schema().name.to_string(),
                    reason: status.last_error.unwrap_or_else(|| "stopped".to_string()),
                });
            }
        }
        Ok(())
    }

    /// Wait for the next pull cycle of a collection to complete.
    pub async fn await_pull_cycle(&self, collection: &str) -> Result<()> {
        let idx = self.shared.index_of(collection)?;
        let seen = self.shared.status(idx).pull_cycles;
        let status = self
            .wait_for_status(idx, |status| status.pull_cycles > seen)
            .await?;
        if status.pull_cycles > seen {
            Ok(())
        } else {
            Err(Error::ReplicationStopped {
                collection: collection.to_string(),
                reason: status.last_error.unwrap_or_else(|| "stopped".to_string()),
            })
        }
    }

    /// Push every queue, then pull every collection from its window start.
    ///
    /// Resolves once all collections finished, or fails with the first error
    /// or with [`Error::Timeout`] after the configured trigger timeout.
    pub async fn trigger_sync(&self) -> Result<SyncReport> {
        if *self.shared.shutdown.borrow() {
            return Err(Error::Cancelled);
        }
        let limit = self.shared.config.trigger_timeout;
        let round = async {
            let results =
                join_all((0..self.shared.collections.len()).map(|idx| self.shared.sync_round(idx)))
                    .await;
            let mut report = SyncReport::default();
            for result in results {
                let part = result?;
                report.pushed += part.pushed;
                report.conflicts += part.conflicts;
                report.rejected += part.rejected;
                report.pulled += part.pulled;
                report.pruned += part.pruned;
            }
            Ok::<_, Error>(report)
        };
        let report = tokio::time::timeout(limit, round)
            .await
            .map_err(|_| Error::Timeout(limit))??;
        tracing::info!(
            "Manual sync done: {} pushed, {} conflicts, {} rejected, {} pulled",
            report.pushed,
            report.conflicts,
            report.rejected,
            report.pulled
        );
        Ok(report)
    }

    /// Ask every collection for a pull from the start of its window.
    pub fn force_resync(&self) {
        self.shared.broadcast(Command::Cycle(PullMode::Restart));
    }

    /// Schedule a push for a collection written outside [`LocalStore`] methods.
    pub fn notify_local_write(&self, collection: &str) -> Result<()> {
        let idx = self.shared.index_of(collection)?;
        self.shared.collections[idx]
            .commands
            .try_send(Command::Push)
            .ok();
        Ok(())
    }

    pub fn notify_connectivity_restored(&self) {
        tracing::debug!("Connectivity restored");
        self.shared.broadcast(Command::Resume);
    }

    pub fn notify_foregrounded(&self) {
        self.shared.broadcast(Command::Cycle(PullMode::Incremental));
    }

    /// Stop every collection task, cancelling in-flight cycles.
    ///
    /// Unacknowledged queue entries stay queued for the next session.
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(error) = task.await {
                tracing::warn!("Replication task ended abnormally: {error}");
            }
        }
        for idx in 0..self.shared.collections.len() {
            self.shared.update_status(idx, |status| {
                status.phase = ReplicationPhase::Stopped;
            });
        }
        tracing::info!("Replication stopped");
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

/// Configures and starts a [`Replicator`].
pub struct ReplicatorBuilder {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    principal: String,
    config: SyncConfig,
    clock: Option<Clock>,
    gap_listener: Option<Arc<dyn ContentGapListener>>,
    legacy_importer: Option<Arc<dyn LegacyImporter>>,
    collections: Option<Vec<String>>,
}

impl ReplicatorBuilder {
    #[must_use]
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the source of "today" (defaults to the local date).
    #[must_use]
    pub fn clock(mut self, clock: impl Fn() -> NaiveDate + Send + Sync + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    #[must_use]
    pub fn gap_listener(mut self, listener: Arc<dyn ContentGapListener>) -> Self {
        self.gap_listener = Some(listener);
        self
    }

    /// Import from a legacy store before replication starts.
    #[must_use]
    pub fn legacy_importer(mut self, importer: Arc<dyn LegacyImporter>) -> Self {
        self.legacy_importer = Some(importer);
        self
    }

    /// Replicate only these collections (defaults to all registered).
    #[must_use]
    pub fn collections<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.collections = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Spawn the per-collection tasks. Requires a Tokio runtime.
    pub async fn start(self) -> Result<Replicator> {
        let schemas: Vec<&'static CollectionSchema> = match &self.collections {
            Some(names) => names
                .iter()
                .map(|name| schema::collection(name))
                .collect::<Result<_>>()?,
            None => COLLECTIONS.iter().collect(),
        };

        if let Some(importer) = &self.legacy_importer {
            if let Err(error) = import_legacy(&self.store, importer.as_ref()).await {
                tracing::warn!("Legacy import failed; will retry next start: {error}");
            }
        }

        let config = Arc::new(self.config);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(|| chrono::Local::now().date_naive()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        let mut receivers = Vec::with_capacity(schemas.len());
        let collections = schemas
            .into_iter()
            .map(|schema| {
                let (commands, receiver) = mpsc::channel(COMMAND_CAPACITY);
                receivers.push(receiver);
                let (status, _) = watch::channel(CollectionStatus {
                    phase: ReplicationPhase::Initializing,
                    ..CollectionStatus::default()
                });
                CollectionHandle {
                    pull: PullEngine::new(
                        self.store.clone(),
                        Arc::clone(&self.remote),
                        Arc::clone(&config),
                        schema,
                        self.principal.clone(),
                    ),
                    status,
                    commands,
                    pull_lock: Mutex::new(()),
                    push_lock: Mutex::new(()),
                }
            })
            .collect();

        let shared = Arc::new(Shared {
            push: PushEngine::new(self.store.clone(), self.remote, Arc::clone(&config)),
            store: self.store,
            config,
            clock,
            collections,
            events,
            gap_listener: self.gap_listener,
            shutdown,
        });

        let tasks = receivers
            .into_iter()
            .enumerate()
            .map(|(idx, receiver)| tokio::spawn(run_collection(Arc::clone(&shared), idx, receiver)))
            .collect();
        tracing::info!(
            "Started replication of {} collection(s) for {}",
            shared.collections.len(),
            self.principal
        );

        Ok(Replicator {
            shared,
            tasks: Mutex::new(tasks),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryRemote, RemoteError};
    use crate::schema::registry::{CONTENT_CACHE, LEARNING_PATH, TRACKS};
    use crate::schema::Row;
    use crate::sync::ContentGapReport;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()
    }

    fn quiet() -> SyncConfig {
        SyncConfig::default()
            .without_auto_sync()
            .with_retry(crate::config::RetryConfig::immediate())
    }

    async fn start(
        remote: &MemoryRemote,
        collections: &[&str],
        config: SyncConfig,
    ) -> Replicator {
        let store = LocalStore::open_in_memory().await.unwrap();
        Replicator::builder(store, Arc::new(remote.clone()), "u1")
            .config(config)
            .clock(today)
            .collections(collections.iter().copied())
            .start()
            .await
            .unwrap()
    }

    async fn within<T>(future: impl std::future::Future<Output = T>) -> T {
        tokio::time::timeout(WAIT, future).await.unwrap()
    }

    #[test]
    fn needs_sync_on_new_day_or_after_six_hours() {
        let at = |text: &str| text.parse::<DateTime<Utc>>().unwrap();
        let now = at("2026-10-16T20:00:00Z");
        assert!(needs_sync(None, &now));
        assert!(!needs_sync(Some(&at("2026-10-16T15:00:00Z")), &now));
        assert!(needs_sync(Some(&at("2026-10-16T13:59:00Z")), &now));
        assert!(needs_sync(Some(&at("2026-10-15T23:00:00Z")), &now));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn initial_replication_uses_local_position() {
        let remote = MemoryRemote::new();
        remote.seed(
            USER_PREFERENCES,
            [row(json!({"id": "p1", "user_id": "u1", "current_content_index": 40}))],
        );
        remote.seed(
            LEARNING_PATH,
            [25, 26, 68, 70, 71].map(|index| {
                row(json!({"id": format!("n{index}"), "user_id": "u1", "node_index": index}))
            }),
        );
        let replicator = start(&remote, &[USER_PREFERENCES, LEARNING_PATH], quiet()).await;

        within(replicator.await_initial_replication()).await.unwrap();
        let ids: Vec<_> = replicator
            .store()
            .list(LEARNING_PATH)
            .await
            .unwrap()
            .into_iter()
            .map(|doc| doc.id)
            .collect();
        assert_eq!(ids, vec!["n26", "n68", "n70"]);
        assert_eq!(replicator.sync_state(), SyncState::Synced);
        let status = replicator.status(LEARNING_PATH).unwrap();
        assert_eq!(status.phase, ReplicationPhase::SteadyState);
        assert!(status.initial_replication_done);
        replicator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_writes_are_pushed_without_a_trigger() {
        let remote = MemoryRemote::new();
        let replicator = start(&remote, &[USER_PREFERENCES], quiet()).await;
        within(replicator.await_initial_replication()).await.unwrap();

        replicator
            .store()
            .insert(USER_PREFERENCES, row(json!({"id": "p1", "user_id": "u1"})))
            .await
            .unwrap();
        within(async {
            while replicator.store().pending_count(None).await.unwrap() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert!(remote.row(USER_PREFERENCES, "p1").is_some());
        replicator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn two_devices_converge_on_the_later_writer() {
        let remote = MemoryRemote::new();
        remote.seed(
            USER_PREFERENCES,
            [row(json!({"id": "p1", "user_id": "u1", "pace": "one_chapter"}))],
        );
        let device_a = start(&remote, &[USER_PREFERENCES], quiet()).await;
        let device_b = start(&remote, &[USER_PREFERENCES], quiet()).await;
        within(device_a.await_initial_replication()).await.unwrap();
        within(device_b.await_initial_replication()).await.unwrap();

        // Both devices write while offline; each automatic push fails once
        remote.set_outage(Some(RemoteError::transient("offline")));
        for (device, pace) in [(&device_a, "two_mishna"), (&device_b, "seder_per_year")] {
            let mut status = device.subscribe_status(USER_PREFERENCES).unwrap();
            device
                .store()
                .update(USER_PREFERENCES, "p1", row(json!({"pace": pace})))
                .await
                .unwrap();
            within(status.wait_for(|status| status.consecutive_failures > 0))
                .await
                .unwrap();
        }
        remote.set_outage(None);

        within(device_b.trigger_sync()).await.unwrap();
        let report = within(device_a.trigger_sync()).await.unwrap();
        assert_eq!(report.conflicts, 1);

        let local = device_a.store().get(USER_PREFERENCES, "p1").await.unwrap().unwrap();
        assert_eq!(local.str_field("pace"), Some("seder_per_year"));
        assert_eq!(device_a.store().pending_count(None).await.unwrap(), 0);
        assert_eq!(device_a.sync_state(), SyncState::Synced);
        device_a.shutdown().await;
        device_b.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn authorization_failure_stops_the_collection() {
        let remote = MemoryRemote::new();
        remote.set_outage(Some(RemoteError::unauthorized("JWT expired")));
        let replicator = start(&remote, &[TRACKS], quiet()).await;

        let error = within(replicator.await_initial_replication()).await.unwrap_err();
        assert!(matches!(error, Error::ReplicationStopped { ref collection, .. } if collection == TRACKS));
        let status = replicator.status(TRACKS).unwrap();
        assert_eq!(status.phase, ReplicationPhase::Stopped);
        assert_eq!(status.state, SyncState::Error);
        assert!(matches!(
            replicator.trigger_sync().await,
            Err(Error::ReplicationStopped { .. })
        ));
        replicator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_write_leaves_replication_running() {
        let remote = MemoryRemote::new();
        let replicator = start(&remote, &[USER_PREFERENCES], quiet()).await;
        within(replicator.await_initial_replication()).await.unwrap();
        let mut events = replicator.subscribe_events();

        remote.fail_next(RemoteError::rejected("new row violates check constraint (400)"));
        replicator
            .store()
            .insert(USER_PREFERENCES, row(json!({"id": "p1", "user_id": "u1"})))
            .await
            .unwrap();
        let reported = within(async {
            loop {
                if let SyncEvent::CycleFailed { error, .. } = events.recv().await.unwrap() {
                    return error;
                }
            }
        })
        .await;
        assert!(reported.contains("check constraint"));

        let status = replicator.status(USER_PREFERENCES).unwrap();
        assert_eq!(status.phase, ReplicationPhase::SteadyState);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(replicator.store().pending_count(None).await.unwrap(), 0);
        assert!(replicator.store().get(USER_PREFERENCES, "p1").await.unwrap().is_none());

        replicator
            .store()
            .insert(USER_PREFERENCES, row(json!({"id": "p2", "user_id": "u1"})))
            .await
            .unwrap();
        within(replicator.trigger_sync()).await.unwrap();
        assert!(remote.row(USER_PREFERENCES, "p2").is_some());
        assert_eq!(replicator.sync_state(), SyncState::Synced);
        replicator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sustained_outage_pauses_until_connectivity_returns() {
        let remote = MemoryRemote::new();
        remote.seed(TRACKS, [row(json!({"id": "t1"}))]);
        remote.set_outage(Some(RemoteError::transient("no route to host")));
        let replicator = start(&remote, &[TRACKS], quiet().with_pause_after_failures(2)).await;

        let mut status = replicator.subscribe_status(TRACKS).unwrap();
        within(status.wait_for(|status| status.phase == ReplicationPhase::Paused))
            .await
            .unwrap();
        assert_eq!(replicator.sync_state(), SyncState::Offline);

        remote.set_outage(None);
        replicator.notify_connectivity_restored();
        within(replicator.await_initial_replication()).await.unwrap();
        assert!(replicator.store().get(TRACKS, "t1").await.unwrap().is_some());
        assert_eq!(replicator.status(TRACKS).unwrap().phase, ReplicationPhase::SteadyState);
        replicator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn trigger_sync_times_out() {
        let remote = MemoryRemote::new();
        let replicator = start(
            &remote,
            &[TRACKS],
            quiet().with_trigger_timeout(Duration::from_millis(50)),
        )
        .await;
        within(replicator.await_initial_replication()).await.unwrap();

        remote.set_latency(Some(Duration::from_millis(500)));
        let error = replicator.trigger_sync().await.unwrap_err();
        assert!(matches!(error, Error::Timeout(limit) if limit == Duration::from_millis(50)));
        replicator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn force_resync_completes_a_pull_cycle() {
        let remote = MemoryRemote::new();
        remote.seed(TRACKS, [row(json!({"id": "t1", "title": "old"}))]);
        let replicator = start(&remote, &[TRACKS], quiet()).await;
        within(replicator.await_initial_replication()).await.unwrap();

        remote.mutate(TRACKS, "t1", row(json!({"title": "new"})));
        let next_cycle = replicator.await_pull_cycle(TRACKS);
        tokio::pin!(next_cycle);
        // Register the waiter before the cycle can finish
        assert!(futures::poll!(next_cycle.as_mut()).is_pending());
        replicator.force_resync();
        within(next_cycle).await.unwrap();

        let track = replicator.store().get(TRACKS, "t1").await.unwrap().unwrap();
        assert_eq!(track.str_field("title"), Some("new"));
        replicator.shutdown().await;
    }

    struct Recorder(StdMutex<Vec<ContentGapReport>>);

    impl ContentGapListener for Recorder {
        fn on_content_gaps(&self, report: &ContentGapReport) {
            self.0.lock().unwrap().push(report.clone());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn content_gaps_reach_the_listener() {
        let remote = MemoryRemote::new();
        remote.seed(
            CONTENT_CACHE,
            (0..=30).map(|index| {
                let explanation = if index == 7 {
                    json!("{}")
                } else {
                    json!({"summary": format!("Mishna {index}")})
                };
                row(json!({"id": format!("c{index:03}"), "content_index": index, "ai_explanation_json": explanation}))
            }),
        );
        let recorder = Arc::new(Recorder(StdMutex::new(Vec::new())));
        let store = LocalStore::open_in_memory().await.unwrap();
        let replicator = Replicator::builder(store, Arc::new(remote.clone()), "u1")
            .config(quiet())
            .clock(today)
            .collections([CONTENT_CACHE])
            .gap_listener(recorder.clone())
            .start()
            .await
            .unwrap();
        let mut events = replicator.subscribe_events();

        within(replicator.await_initial_replication()).await.unwrap();
        let reports = recorder.0.lock().unwrap().clone();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].placeholders, vec![7]);
        assert!(reports[0].missing.is_empty());

        replicator.trigger_sync().await.unwrap();
        let gaps = within(async {
            loop {
                if let SyncEvent::ContentGaps(report) = events.recv().await.unwrap() {
                    return report;
                }
            }
        })
        .await;
        assert_eq!(gaps.indexes(), vec![7]);
        replicator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_keeps_unpushed_writes_queued() {
        let remote = MemoryRemote::new();
        let replicator = start(&remote, &[USER_PREFERENCES], quiet()).await;
        within(replicator.await_initial_replication()).await.unwrap();

        remote.set_outage(Some(RemoteError::transient("offline")));
        replicator
            .store()
            .insert(USER_PREFERENCES, row(json!({"id": "p1", "user_id": "u1"})))
            .await
            .unwrap();
        replicator.shutdown().await;

        assert_eq!(replicator.store().pending_count(None).await.unwrap(), 1);
        assert_eq!(
            replicator.status(USER_PREFERENCES).unwrap().phase,
            ReplicationPhase::Stopped
        );
        assert!(matches!(replicator.trigger_sync().await, Err(Error::Cancelled)));
    }
}
