//! Pull checkpoint model

use serde::{Deserialize, Serialize};

/// Cursor marking the last remote row pulled into a collection.
///
/// Only valid for the window it was computed under; `window_key` records
/// that window's fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub collection: String,
    pub last_seen_id: String,
    pub last_seen_modified: Option<String>,
    pub window_key: String,
}

impl Checkpoint {
    /// Whether this cursor can continue a pull under the given window.
    pub fn is_valid_for(&self, window_key: &str) -> bool {
        self.window_key == window_key
    }

    /// Whether storing this cursor over `stored` keeps progress monotonic.
    ///
    /// A cursor from another window always replaces the stored one.
    pub fn supersedes(&self, stored: Option<&Self>) -> bool {
        !stored.is_some_and(|stored| {
            stored.window_key == self.window_key && self.last_seen_id < stored.last_seen_id
        })
    }
}
