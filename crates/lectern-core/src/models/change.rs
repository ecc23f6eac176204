//! Change-queue entry model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::Payload;
use crate::{Error, Result};

/// Kind of local write recorded in the change queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeOp {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("unknown change op: {other}"))),
        }
    }
}

/// A local write waiting to be applied to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Insertion order; drains FIFO by this key
    pub seq: i64,
    pub collection: String,
    pub op: ChangeOp,
    pub doc_id: String,
    /// Document payload captured when the write happened
    pub payload: Payload,
    /// Remote `updated_at` the write was based on, if one was known
    pub assumed_modified: Option<String>,
    /// Enqueue time (unix ms)
    pub enqueued_at: i64,
    /// Failed delivery attempts so far
    pub attempts: i64,
    pub last_error: Option<String>,
}
