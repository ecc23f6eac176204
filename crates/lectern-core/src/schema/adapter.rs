//! Row ⇄ document conversion driven by the schema registry.

use serde_json::{Map, Value};
use thiserror::Error;

use super::registry::{CollectionSchema, Coercion, FieldRule};
use crate::models::{ChangeOp, Document, Payload};

/// A remote row as JSON.
pub type Row = Map<String, Value>;

/// A row that cannot be represented as a local document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("{collection}: row has no string id")]
    MissingId { collection: &'static str },
    #[error("{collection}.{field}: expected {expected}, got {found}")]
    InvalidType {
        collection: &'static str,
        field: String,
        expected: &'static str,
        found: String,
    },
}

/// Convert a pulled remote row into a local document.
pub fn row_to_document(schema: &CollectionSchema, row: &Row) -> Result<Document, SchemaError> {
    let id = row
        .get(CollectionSchema::ID_FIELD)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or(SchemaError::MissingId {
            collection: schema.name,
        })?
        .to_string();

    let mut payload = Payload::new();
    for (name, value) in row {
        if name == CollectionSchema::ID_FIELD || schema.rule(name) == FieldRule::LocalOnly {
            continue;
        }
        if value.is_null() {
            if schema.is_nullable(name) {
                payload.insert(name.clone(), Value::Null);
            }
            continue;
        }
        let value = match schema.coercion(name) {
            Coercion::None => value.clone(),
            Coercion::BoolAsInt => bool_to_int(schema, name, value)?,
        };
        payload.insert(name.clone(), value);
    }

    let modified = row
        .get(CollectionSchema::MODIFIED_FIELD)
        .and_then(Value::as_str)
        .map(ToString::to_string);

    Ok(Document {
        id,
        deleted: false,
        modified,
        payload,
    })
}

/// Convert a local document payload into the row sent for a push.
///
/// Local-only fields never leave the device. Updates additionally drop
/// server-managed fields so the remote keeps stamping them.
pub fn document_to_row(schema: &CollectionSchema, id: &str, payload: &Payload, op: ChangeOp) -> Row {
    let mut row = Row::new();
    row.insert(
        CollectionSchema::ID_FIELD.to_string(),
        Value::String(id.to_string()),
    );
    for (name, value) in payload {
        if name == CollectionSchema::ID_FIELD || name == "_deleted" {
            continue;
        }
        match schema.rule(name) {
            FieldRule::LocalOnly => continue,
            FieldRule::ServerManaged if op == ChangeOp::Update => continue,
            FieldRule::ServerManaged | FieldRule::Synced => {}
        }
        if value.is_null() && !schema.is_nullable(name) {
            continue;
        }
        let value = match schema.coercion(name) {
            Coercion::None => value.clone(),
            Coercion::BoolAsInt => int_to_bool(value),
        };
        row.insert(name.clone(), value);
    }
    row
}

/// Copy local-only fields of an existing document into an incoming remote payload.
pub fn carry_local_only(schema: &CollectionSchema, existing: &Payload, incoming: &mut Payload) {
    for (name, value) in existing {
        if schema.rule(name) == FieldRule::LocalOnly {
            incoming.insert(name.clone(), value.clone());
        }
    }
}

fn bool_to_int(schema: &CollectionSchema, field: &str, value: &Value) -> Result<Value, SchemaError> {
    match value {
        Value::Bool(flag) => Ok(Value::from(i64::from(*flag))),
        Value::Number(number) if number.as_i64().is_some_and(|n| n == 0 || n == 1) => {
            Ok(value.clone())
        }
        other => Err(SchemaError::InvalidType {
            collection: schema.name,
            field: field.to_string(),
            expected: "boolean",
            found: other.to_string(),
        }),
    }
}

fn int_to_bool(value: &Value) -> Value {
    match value {
        Value::Number(number) => Value::Bool(number.as_i64().is_some_and(|n| n != 0)),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::registry::{collection, LEARNING_PATH, USER_PREFERENCES, USER_STUDY_LOG};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn pulled_booleans_become_integers() {
        let schema = collection(USER_STUDY_LOG).unwrap();
        let doc = row_to_document(
            schema,
            &row(json!({
                "id": "log-1",
                "study_date": "2026-10-16",
                "is_completed": true,
                "updated_at": "2026-10-16T08:00:00Z"
            })),
        )
        .unwrap();

        assert_eq!(doc.id, "log-1");
        assert_eq!(doc.modified.as_deref(), Some("2026-10-16T08:00:00Z"));
        assert_eq!(doc.payload["is_completed"], json!(1));
        assert!(!doc.payload.contains_key("id"));
    }

    #[test]
    fn nulls_survive_only_in_nullable_fields() {
        let schema = collection(LEARNING_PATH).unwrap();
        let doc = row_to_document(
            schema,
            &row(json!({
                "id": "node-1",
                "node_index": 3,
                "completed_at": null,
                "node_type": null,
                "is_divider": false
            })),
        )
        .unwrap();

        assert_eq!(doc.payload.get("completed_at"), Some(&Value::Null));
        assert!(!doc.payload.contains_key("node_type"));
        assert_eq!(doc.payload["is_divider"], json!(0));
    }

    #[test]
    fn rows_without_id_or_with_bad_booleans_are_rejected() {
        let schema = collection(USER_STUDY_LOG).unwrap();
        assert_eq!(
            row_to_document(schema, &row(json!({"study_date": "2026-10-16"}))),
            Err(SchemaError::MissingId {
                collection: USER_STUDY_LOG
            })
        );
        assert!(matches!(
            row_to_document(schema, &row(json!({"id": "x", "is_completed": "yes"}))),
            Err(SchemaError::InvalidType { field, .. }) if field == "is_completed"
        ));
    }

    #[test]
    fn local_only_fields_never_cross_the_boundary() {
        let schema = collection(USER_PREFERENCES).unwrap();
        let doc = row_to_document(
            schema,
            &row(json!({"id": "p", "pace": "one_chapter", "yom_tov_dates": ["2026-10-03"]})),
        )
        .unwrap();
        assert!(!doc.payload.contains_key("yom_tov_dates"));

        let mut payload = doc.payload;
        payload.insert("yom_tov_dates_until".to_string(), json!("2027-01-01"));
        let pushed = document_to_row(schema, "p", &payload, ChangeOp::Update);
        assert!(!pushed.contains_key("yom_tov_dates_until"));
        assert_eq!(pushed["id"], json!("p"));
    }

    #[test]
    fn updates_drop_server_managed_fields_but_inserts_keep_them() {
        let schema = collection(USER_STUDY_LOG).unwrap();
        let payload = row(json!({
            "study_date": "2026-10-16",
            "is_completed": 1,
            "completed_at": null,
            "created_at": "2026-10-01T00:00:00Z",
            "updated_at": "2026-10-02T00:00:00Z",
            "_deleted": false
        }));

        let update = document_to_row(schema, "log-1", &payload, ChangeOp::Update);
        assert_eq!(
            update,
            row(json!({
                "id": "log-1",
                "study_date": "2026-10-16",
                "is_completed": true,
                "completed_at": null
            }))
        );

        let insert = document_to_row(schema, "log-1", &payload, ChangeOp::Insert);
        assert!(insert.contains_key("created_at"));
        assert!(!insert.contains_key("_deleted"));
    }

    #[test]
    fn remote_payload_keeps_the_devices_local_only_fields() {
        let schema = collection(USER_PREFERENCES).unwrap();
        let existing = row(json!({"pace": "one_chapter", "yom_tov_dates": ["2026-10-03"]}));
        let mut incoming = row(json!({"pace": "two_mishna"}));
        carry_local_only(schema, &existing, &mut incoming);
        assert_eq!(
            incoming,
            row(json!({"pace": "two_mishna", "yom_tov_dates": ["2026-10-03"]}))
        );
    }
}
