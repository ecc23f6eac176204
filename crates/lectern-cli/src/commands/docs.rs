use std::path::Path;

use lectern_core::models::{Document, Payload};
use lectern_core::schema::{self, CollectionSchema, Scope};
use serde_json::Value;

use crate::commands::common::{open_store, parse_payload, resolve_user_id, with_owner};
use crate::error::CliError;

pub async fn run_get(collection: &str, id: &str, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let document = store
        .get(collection, id)
        .await?
        .ok_or_else(|| CliError::DocumentNotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        })?;
    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}

pub async fn run_put(
    collection: &str,
    json: &str,
    db_path: &Path,
    profile: Option<&str>,
) -> Result<(), CliError> {
    let schema = schema::collection(collection)?;
    let mut payload = parse_payload(json)?;
    if needs_owner(schema, &payload) {
        payload = with_owner(schema, payload, resolve_user_id(profile)?.as_deref());
    }
    let document = put_document(db_path, schema, payload).await?;
    println!("{}", document.id);
    Ok(())
}

fn needs_owner(schema: &CollectionSchema, payload: &Payload) -> bool {
    matches!(schema.scope, Scope::Owner { field } if !payload.contains_key(field))
}

/// Update when the payload names an existing document, insert otherwise.
pub async fn put_document(
    db_path: &Path,
    schema: &CollectionSchema,
    mut payload: Payload,
) -> Result<Document, CliError> {
    let store = open_store(db_path).await?;
    let existing_id = payload
        .get(CollectionSchema::ID_FIELD)
        .and_then(Value::as_str)
        .map(ToString::to_string);
    if let Some(id) = existing_id {
        if store.get(schema.name, &id).await?.is_some() {
            payload.remove(CollectionSchema::ID_FIELD);
            return Ok(store.update(schema.name, &id, payload).await?);
        }
    }
    Ok(store.insert(schema.name, payload).await?)
}

pub async fn run_delete(collection: &str, id: &str, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    store.delete(collection, id).await?;
    println!("{id}");
    Ok(())
}
