//! Windowed, checkpointed pull of remote rows into the local store.

use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::Value;

use super::gaps::detect_content_gaps;
use super::ContentGapReport;
use crate::config::SyncConfig;
use crate::models::{Checkpoint, Document, Preferences};
use crate::remote::{with_timeout, Filter, RemoteQuery, RemoteStore};
use crate::schema::{row_to_document, CollectionSchema, Scope, WindowSpec};
use crate::services::LocalStore;
use crate::window::{compute_window, Window, WindowReference};
use crate::Result;

/// Where a pull cycle starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullMode {
    /// Continue from the stored checkpoint
    Incremental,
    /// Start over from the beginning of the window
    Restart,
}

/// One fetched and converted page.
#[derive(Debug, Clone, PartialEq)]
pub struct PullPage {
    pub documents: Vec<Document>,
    /// Cursor after this page; `None` when the page was empty
    pub checkpoint: Option<Checkpoint>,
    /// Rows returned by the remote, including ones that failed conversion
    pub fetched: usize,
    pub skipped_invalid: usize,
}

/// Totals of one pull cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PullCycle {
    pub window: Window,
    pub pages: usize,
    pub written: usize,
    pub skipped: usize,
    pub pruned: usize,
    pub gaps: Option<ContentGapReport>,
}

/// Pulls one collection for one principal.
#[derive(Clone)]
pub struct PullEngine {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    config: Arc<SyncConfig>,
    schema: &'static CollectionSchema,
    principal: String,
}

impl PullEngine {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        config: Arc<SyncConfig>,
        schema: &'static CollectionSchema,
        principal: impl Into<String>,
    ) -> Self {
        Self {
            store,
            remote,
            config,
            schema,
            principal: principal.into(),
        }
    }

    pub const fn schema(&self) -> &'static CollectionSchema {
        self.schema
    }

    fn page_size(&self) -> usize {
        self.schema.page_size(self.config.pull_page_size)
    }

    /// The collection's window for `today`, positioned from local preferences.
    pub async fn window(&self, today: NaiveDate) -> Result<Window> {
        let preferences = match self.schema.window {
            WindowSpec::Position { .. } => self.store.preferences(&self.principal).await?,
            WindowSpec::Unbounded | WindowSpec::Date { .. } => Preferences::default(),
        };
        let reference = WindowReference { today, preferences };
        Ok(compute_window(self.schema.window, &reference, &self.config))
    }

    fn query(&self, window: &Window, after: Option<String>) -> RemoteQuery {
        let mut query = RemoteQuery::new(self.schema.name, self.page_size());
        if let Scope::Owner { field } = self.schema.scope {
            query = query.filter(Filter::eq(field, self.principal.as_str()));
        }
        query.filters(window.bounds_for_query()).after(after)
    }

    /// Fetch the page after `checkpoint` and convert it.
    ///
    /// A checkpoint computed under another window is ignored. Rows that fail
    /// conversion are skipped but still advance the cursor.
    pub async fn pull_page(
        &self,
        checkpoint: Option<&Checkpoint>,
        window: &Window,
    ) -> Result<PullPage> {
        let window_key = window.key();
        let after = checkpoint
            .filter(|checkpoint| checkpoint.is_valid_for(&window_key))
            .map(|checkpoint| checkpoint.last_seen_id.clone());
        let query = self.query(window, after);
        let rows = with_timeout(self.config.request_timeout, self.remote.select(&query)).await?;

        let mut page = PullPage {
            documents: Vec::with_capacity(rows.len()),
            checkpoint: None,
            fetched: rows.len(),
            skipped_invalid: 0,
        };
        for row in &rows {
            match row_to_document(self.schema, row) {
                Ok(doc) => page.documents.push(doc),
                Err(error) => {
                    tracing::warn!("Skipping {} row: {error}", self.schema.name);
                    page.skipped_invalid += 1;
                }
            }
        }

        page.checkpoint = rows.iter().rev().find_map(|row| {
            let id = row.get(CollectionSchema::ID_FIELD)?.as_str()?;
            Some(Checkpoint {
                collection: self.schema.name.to_string(),
                last_seen_id: id.to_string(),
                last_seen_modified: row
                    .get(CollectionSchema::MODIFIED_FIELD)
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                window_key: window_key.clone(),
            })
        });
        Ok(page)
    }

    /// Pull pages until a short page, then prune and look for content gaps.
    ///
    /// A failed page aborts the cycle; pages already committed stay, as
    /// does their checkpoint.
    pub async fn run_cycle(&self, today: NaiveDate, mode: PullMode) -> Result<PullCycle> {
        let window = self.window(today).await?;
        let window_key = window.key();
        let mut checkpoint = match mode {
            PullMode::Restart => None,
            PullMode::Incremental => self
                .store
                .checkpoint(self.schema.name)
                .await?
                .filter(|checkpoint| checkpoint.is_valid_for(&window_key)),
        };

        let mut cycle = PullCycle {
            window,
            pages: 0,
            written: 0,
            skipped: 0,
            pruned: 0,
            gaps: None,
        };
        let page_size = self.page_size();
        loop {
            let fence = self.store.conflict_fence().await?;
            let page = self.pull_page(checkpoint.as_ref(), &cycle.window).await?;
            let commit = self
                .store
                .commit_pull_page(self.schema, &page.documents, page.checkpoint.as_ref(), fence)
                .await?;

            cycle.pages += 1;
            cycle.written += commit.written;
            cycle.skipped += commit.skipped_pending + commit.skipped_fenced + page.skipped_invalid;
            tracing::debug!(
                "Pulled {} page {}: {} rows, {} written",
                self.schema.name,
                cycle.pages,
                page.fetched,
                commit.written
            );

            if page.checkpoint.is_some() {
                checkpoint = page.checkpoint;
            }
            if page.fetched < page_size {
                break;
            }
        }

        cycle.pruned = self.store.prune(self.schema, &cycle.window).await?;
        cycle.gaps = detect_content_gaps(&self.store, self.schema, &cycle.window).await?;
        tracing::info!(
            "Pull cycle for {} ({}) done: {} written, {} skipped, {} pruned",
            self.schema.name,
            window_key,
            cycle.written,
            cycle.skipped,
            cycle.pruned
        );
        Ok(cycle)
    }
}
