//! Content-gap detection for generated content.

use std::collections::BTreeMap;

use serde_json::Value;

use super::ContentGapReport;
use crate::schema::CollectionSchema;
use crate::services::LocalStore;
use crate::window::Window;
use crate::Result;

/// Receives content indexes that need generating.
///
/// Called after a pull cycle of a collection with a gap field. The engine
/// only reports gaps; issuing the generate request is up to the listener.
pub trait ContentGapListener: Send + Sync {
    fn on_content_gaps(&self, report: &ContentGapReport);
}

/// Whether a generated payload is missing or a placeholder.
///
/// Payloads may be stored as JSON text or as an object. Anything without a
/// non-empty `summary` counts as a placeholder.
pub fn is_placeholder(value: Option<&Value>) -> bool {
    let parsed;
    let object = match value {
        Some(Value::String(text)) => {
            parsed = serde_json::from_str::<Value>(text).ok();
            parsed.as_ref().and_then(Value::as_object)
        }
        Some(Value::Object(object)) => Some(object),
        _ => None,
    };
    !object
        .and_then(|object| object.get("summary"))
        .and_then(Value::as_str)
        .is_some_and(|summary| !summary.trim().is_empty())
}

/// Compare the position window with the local cache of a gap-tracked collection.
pub async fn detect_content_gaps(
    store: &LocalStore,
    schema: &CollectionSchema,
    window: &Window,
) -> Result<Option<ContentGapReport>> {
    let (Some(gap_field), Window::Position { field, start, end }) = (schema.gap_field, window) else {
        return Ok(None);
    };

    let mut cached = BTreeMap::new();
    for doc in store.list(schema.name).await? {
        let Some(index) = doc.int_field(field).and_then(|index| u64::try_from(index).ok()) else {
            continue;
        };
        if (*start..=*end).contains(&index) {
            cached.insert(index, is_placeholder(doc.payload.get(gap_field)));
        }
    }

    let mut report = ContentGapReport {
        collection: schema.name,
        missing: Vec::new(),
        placeholders: Vec::new(),
    };
    for index in *start..=*end {
        match cached.get(&index) {
            None => report.missing.push(index),
            Some(true) => report.placeholders.push(index),
            Some(false) => {}
        }
    }
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Document;
    use crate::schema::registry::{CONTENT_CACHE, TRACKS};
    use crate::schema::collection;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn cached(id: &str, index: u64, explanation: Value) -> Document {
        Document::new(
            id,
            json!({"content_index": index, "ai_explanation_json": explanation})
                .as_object()
                .cloned()
                .unwrap(),
        )
    }

    #[test]
    fn placeholders_lack_a_summary() {
        assert!(is_placeholder(None));
        assert!(is_placeholder(Some(&json!("not json"))));
        assert!(is_placeholder(Some(&json!(r#"{"summary": "  "}"#))));
        assert!(is_placeholder(Some(&json!({"status": "pending"}))));
        assert!(!is_placeholder(Some(&json!(r#"{"summary": "Blessings"}"#))));
        assert!(!is_placeholder(Some(&json!({"summary": "Blessings"}))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reports_missing_and_placeholder_indexes() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let schema = collection(CONTENT_CACHE).unwrap();
        store
            .commit_pull_page(
                schema,
                &[
                    cached("c1", 1, json!({"summary": "ok"})),
                    cached("c2", 2, json!("{}")),
                    cached("c9", 9, json!({"summary": "outside"})),
                ],
                None,
                0,
            )
            .await
            .unwrap();

        let window = Window::Position {
            field: "content_index",
            start: 0,
            end: 3,
        };
        let report = detect_content_gaps(&store, schema, &window)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.missing, vec![0, 3]);
        assert_eq!(report.placeholders, vec![2]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn collections_without_gap_field_are_ignored() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let report = detect_content_gaps(&store, collection(TRACKS).unwrap(), &Window::Unbounded)
            .await
            .unwrap();
        assert!(report.is_none());
    }
}
