use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, NaiveDate, SecondsFormat, TimeZone, Utc};
use lectern_core::models::{ChangeEntry, Payload, SyncConflict};
use lectern_core::schema::{CollectionSchema, Scope};
use lectern_core::sync::SyncEvent;
use lectern_core::util::{compact_text, normalize_text_option};
use lectern_core::{LocalStore, PostgrestRemote, RemoteConfig, Replicator, SyncConfig};
use serde::Serialize;
use serde_json::Value;

use crate::config_profiles::CliProfilesConfig;
use crate::error::CliError;

pub const ACCESS_TOKEN_ENV: &str = "LECTERN_ACCESS_TOKEN";
pub const USER_ID_ENV: &str = "LECTERN_USER_ID";
const DB_PATH_ENV: &str = "LECTERN_DB_PATH";

#[derive(Debug, Serialize)]
pub struct SyncConflictItem {
    pub id: i64,
    pub collection: String,
    pub document_id: String,
    pub local_modified: Option<String>,
    pub remote_modified: Option<String>,
    pub resolved_at: i64,
    pub resolved_at_iso: String,
    pub strategy: String,
}

#[derive(Debug, Serialize)]
pub struct QueueItem {
    pub seq: i64,
    pub collection: String,
    pub op: &'static str,
    pub doc_id: String,
    pub assumed_modified: Option<String>,
    pub fields: Vec<String>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub enqueued_at_iso: String,
}

/// Remote endpoint and principal for commands that talk to the backend.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub remote: RemoteConfig,
    pub user_id: String,
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os(DB_PATH_ENV).map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lectern")
        .join("lectern.db")
}

pub async fn open_store(path: &Path) -> Result<LocalStore, CliError> {
    Ok(LocalStore::open_path(path).await?)
}

/// Profile values win; the environment fills what the profile lacks.
pub fn sync_settings(profile: Option<&str>) -> Result<SyncSettings, CliError> {
    let (profile_name, profile) = CliProfilesConfig::load()?.select(profile);

    let supabase_url = profile
        .supabase_url()
        .or_else(|| normalize_text_option(env::var("SUPABASE_URL").ok()));
    let anon_key = profile
        .supabase_anon_key()
        .or_else(|| normalize_text_option(env::var("SUPABASE_ANON_KEY").ok()));
    let user_id = profile
        .user_id()
        .or_else(|| normalize_text_option(env::var(USER_ID_ENV).ok()));
    let (Some(supabase_url), Some(anon_key), Some(user_id)) = (supabase_url, anon_key, user_id)
    else {
        return Err(CliError::SyncNotConfigured);
    };

    let mut remote = RemoteConfig::new(supabase_url, anon_key);
    if let Some(token) = normalize_text_option(env::var(ACCESS_TOKEN_ENV).ok()) {
        remote = remote.with_access_token(token);
    } else {
        tracing::warn!("{ACCESS_TOKEN_ENV} is not set; requests use the anon key only");
    }
    tracing::debug!("Using profile '{}'", profile_name);
    Ok(SyncSettings { remote, user_id })
}

/// User id from the profile or `LECTERN_USER_ID`, when one is configured.
pub fn resolve_user_id(profile: Option<&str>) -> Result<Option<String>, CliError> {
    let (_, profile) = CliProfilesConfig::load()?.select(profile);
    Ok(profile
        .user_id()
        .or_else(|| normalize_text_option(env::var(USER_ID_ENV).ok())))
}

pub async fn start_replicator(
    store: LocalStore,
    settings: SyncSettings,
    config: SyncConfig,
) -> Result<Replicator, CliError> {
    let remote = PostgrestRemote::new(settings.remote, config.request_timeout)?;
    Ok(Replicator::builder(store, Arc::new(remote), settings.user_id)
        .config(config)
        .start()
        .await?)
}

pub fn parse_payload(json: &str) -> Result<Payload, CliError> {
    match serde_json::from_str::<Value>(json)? {
        Value::Object(payload) => Ok(payload),
        _ => Err(CliError::PayloadNotObject),
    }
}

pub fn parse_date(value: Option<&str>) -> Result<NaiveDate, CliError> {
    let Some(value) = normalize_text_option(value.map(ToString::to_string)) else {
        return Ok(Local::now().date_naive());
    };
    NaiveDate::parse_from_str(&value, "%Y-%m-%d").map_err(|_| CliError::InvalidDate(value))
}

/// Stamp the owner field on writes to owner-scoped collections.
pub fn with_owner(schema: &CollectionSchema, mut payload: Payload, user_id: Option<&str>) -> Payload {
    if let (Scope::Owner { field }, Some(user_id)) = (schema.scope, user_id) {
        payload
            .entry(field.to_string())
            .or_insert_with(|| Value::String(user_id.to_string()));
    }
    payload
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .map_or_else(
            || timestamp_ms.to_string(),
            |time| time.to_rfc3339_opts(SecondsFormat::Secs, true),
        )
}

pub fn sync_conflict_to_item(conflict: &SyncConflict) -> SyncConflictItem {
    SyncConflictItem {
        id: conflict.id,
        collection: conflict.collection.clone(),
        document_id: conflict.document_id.clone(),
        local_modified: conflict.local_modified.clone(),
        remote_modified: conflict.remote_modified.clone(),
        resolved_at: conflict.resolved_at,
        resolved_at_iso: format_sync_timestamp(conflict.resolved_at),
        strategy: conflict.strategy.clone(),
    }
}

pub fn format_sync_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {}/{}  {} -> {}  [{}]",
                format_sync_timestamp(conflict.resolved_at),
                conflict.collection,
                conflict.document_id,
                conflict.local_modified.as_deref().unwrap_or("-"),
                conflict.remote_modified.as_deref().unwrap_or("deleted"),
                conflict.strategy
            )
        })
        .collect()
}

pub fn queue_entry_to_item(entry: &ChangeEntry) -> QueueItem {
    QueueItem {
        seq: entry.seq,
        collection: entry.collection.clone(),
        op: entry.op.as_str(),
        doc_id: entry.doc_id.clone(),
        assumed_modified: entry.assumed_modified.clone(),
        fields: entry.payload.keys().cloned().collect(),
        attempts: entry.attempts,
        last_error: entry.last_error.clone(),
        enqueued_at_iso: format_sync_timestamp(entry.enqueued_at),
    }
}

pub fn format_queue_lines(entries: &[ChangeEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let payload = Value::Object(entry.payload.clone()).to_string();
            let mut line = format!(
                "#{:<5} {:<6} {}/{}  {}",
                entry.seq,
                entry.op.as_str(),
                entry.collection,
                entry.doc_id,
                compact_text(&payload)
            );
            if let Some(error) = &entry.last_error {
                line.push_str(&format!("  (attempts: {}, last error: {error})", entry.attempts));
            }
            line
        })
        .collect()
}

pub fn format_event(event: &SyncEvent) -> String {
    match event {
        SyncEvent::StatusChanged { collection, status } => format!(
            "{collection}: {} / {}",
            status.phase.as_str(),
            status.state.as_str()
        ),
        SyncEvent::ConflictResolved(conflict) => format!(
            "{}/{}: remote version kept",
            conflict.collection, conflict.doc_id
        ),
        SyncEvent::ContentGaps(report) => {
            let indexes = report
                .indexes()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            format!("{}: content needed for {indexes}", report.collection)
        }
        SyncEvent::CycleFailed { collection, error } => format!("{collection}: failed: {error}"),
    }
}
