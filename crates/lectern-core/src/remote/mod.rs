//! Remote store interface.
//!
//! The replication engine only talks to the backend through [`RemoteStore`]:
//! id-ordered, filterable reads plus insert, conditional update and delete.
//! [`PostgrestRemote`] speaks to Supabase; [`MemoryRemote`] backs tests.

mod memory;
mod postgrest;

use std::cmp::Ordering;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryRemote;
pub use postgrest::PostgrestRemote;

use crate::schema::Row;

/// Comparison applied by a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gt,
    Gte,
    Lte,
}

impl FilterOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lte => "lte",
        }
    }
}

/// One predicate of a remote query.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Gt, value)
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Gte, value)
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Lte, value)
    }

    /// Evaluate against a row; missing or incomparable fields never match.
    pub fn matches(&self, row: &Row) -> bool {
        let Some(ordering) = row
            .get(&self.field)
            .and_then(|value| compare_values(value, &self.value))
        else {
            return false;
        };
        match self.op {
            FilterOp::Eq => ordering == Ordering::Equal,
            FilterOp::Gt => ordering == Ordering::Greater,
            FilterOp::Gte => ordering != Ordering::Less,
            FilterOp::Lte => ordering != Ordering::Greater,
        }
    }

    /// Value rendered the way PostgREST expects it in a query string.
    pub fn value_text(&self) -> String {
        match &self.value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::String(b)) => a.as_f64()?.partial_cmp(&b.parse().ok()?),
        (Value::String(a), Value::Number(b)) => a.parse::<f64>().ok()?.partial_cmp(&b.as_f64()?),
        _ => None,
    }
}

/// Id-ordered page request against one table.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteQuery {
    pub table: String,
    pub filters: Vec<Filter>,
    /// Only rows with `id` strictly greater than this
    pub after_id: Option<String>,
    pub limit: usize,
}

impl RemoteQuery {
    pub fn new(table: impl Into<String>, limit: usize) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
            after_id: None,
            limit,
        }
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn filters(mut self, filters: impl IntoIterator<Item = Filter>) -> Self {
        self.filters.extend(filters);
        self
    }

    #[must_use]
    pub fn after(mut self, id: Option<String>) -> Self {
        self.after_id = id;
        self
    }
}

/// Condition an update must satisfy to be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Precondition {
    pub field: String,
    pub value: Value,
}

impl Precondition {
    pub fn modified(marker: impl Into<String>) -> Self {
        Self {
            field: crate::schema::CollectionSchema::MODIFIED_FIELD.to_string(),
            value: Value::String(marker.into()),
        }
    }
}

/// Classification of a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Network or server failure; retry on the next cycle
    Transient,
    /// Call exceeded its time bound
    Timeout,
    /// Principal lacks access; retrying will not help
    Unauthorized,
    /// Insert hit an existing primary key
    DuplicateKey,
    /// Request refused for another reason (bad payload, constraint)
    Rejected,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Remote {kind:?} error: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Transient, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Unauthorized, message)
    }

    pub fn duplicate_key(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::DuplicateKey, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Rejected, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(RemoteErrorKind::Timeout, format!("no response after {after:?}"))
    }

    /// Whether the next scheduled cycle may succeed without intervention.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            RemoteErrorKind::Transient | RemoteErrorKind::Timeout
        )
    }

    /// Whether the failure stops the collection until the caller steps in.
    ///
    /// A rejected write only affects its own entry.
    pub const fn is_fatal(&self) -> bool {
        matches!(self.kind, RemoteErrorKind::Unauthorized)
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Authoritative relational backend, authorized per row for one principal.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Rows matching the query, ordered by `id` ascending.
    async fn select(&self, query: &RemoteQuery) -> RemoteResult<Vec<Row>>;

    /// One row by id.
    async fn fetch(&self, table: &str, id: &str) -> RemoteResult<Option<Row>>;

    /// Insert a row and return it as stored.
    ///
    /// Fails with [`RemoteErrorKind::DuplicateKey`] when the id exists.
    async fn insert(&self, table: &str, row: &Row) -> RemoteResult<Row>;

    /// Update a row by id, optionally only when `precondition` holds.
    ///
    /// Returns `None` when no row matched.
    async fn update(
        &self,
        table: &str,
        id: &str,
        row: &Row,
        precondition: Option<&Precondition>,
    ) -> RemoteResult<Option<Row>>;

    /// Delete a row by id; returns whether a row was removed.
    async fn delete(&self, table: &str, id: &str) -> RemoteResult<bool>;
}

/// Bound a remote call, turning an elapsed timer into a retryable error.
pub async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = RemoteResult<T>> + Send,
) -> RemoteResult<T> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or_else(|_| Err(RemoteError::timeout(limit)))
}
