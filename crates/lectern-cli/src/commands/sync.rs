use std::path::Path;

use chrono::{SecondsFormat, Utc};
use lectern_core::schema::COLLECTIONS;
use lectern_core::sync::needs_sync;
use lectern_core::SyncConfig;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use crate::commands::common::{
    format_event, format_sync_conflict_lines, open_store, start_replicator, sync_conflict_to_item,
    sync_settings, SyncConflictItem,
};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct CollectionSyncItem {
    pub collection: &'static str,
    pub checkpoint: Option<String>,
    pub window_key: Option<String>,
    pub pending: usize,
}

#[derive(Debug, Serialize)]
pub struct SyncStatusReport {
    pub last_sync_at: Option<String>,
    pub sync_due: bool,
    pub collections: Vec<CollectionSyncItem>,
}

pub async fn run_sync(db_path: &Path, profile: Option<&str>) -> Result<(), CliError> {
    let settings = sync_settings(profile)?;
    let store = open_store(db_path).await?;
    let replicator =
        start_replicator(store, settings, SyncConfig::default().without_auto_sync()).await?;

    let result = replicator.trigger_sync().await;
    replicator.shutdown().await;
    let report = result?;
    println!(
        "Sync completed: {} pushed, {} conflicts resolved, {} rejected, {} pulled, {} pruned",
        report.pushed, report.conflicts, report.rejected, report.pulled, report.pruned
    );
    Ok(())
}

pub async fn sync_status(db_path: &Path) -> Result<SyncStatusReport, CliError> {
    let store = open_store(db_path).await?;
    let last_sync_at = store.last_sync_at().await?;

    let mut collections = Vec::with_capacity(COLLECTIONS.len());
    for schema in COLLECTIONS {
        let checkpoint = store.checkpoint(schema.name).await?;
        collections.push(CollectionSyncItem {
            collection: schema.name,
            checkpoint: checkpoint.as_ref().map(|cp| cp.last_seen_id.clone()),
            window_key: checkpoint.map(|cp| cp.window_key),
            pending: store.pending_count(Some(schema.name)).await?,
        });
    }

    Ok(SyncStatusReport {
        sync_due: needs_sync(last_sync_at.as_ref(), &Utc::now()),
        last_sync_at: last_sync_at.map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true)),
        collections,
    })
}

pub async fn run_sync_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let report = sync_status(db_path).await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "Last sync: {}{}",
        report.last_sync_at.as_deref().unwrap_or("never"),
        if report.sync_due { " (sync due)" } else { "" }
    );
    for item in &report.collections {
        println!(
            "{:<18} pending {:<4} checkpoint {}",
            item.collection,
            item.pending,
            item.checkpoint.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub async fn run_sync_conflicts(
    limit: usize,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let conflicts = store.list_sync_conflicts(limit).await?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(sync_conflict_to_item)
            .collect::<Vec<SyncConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_sync_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_sync_watch(db_path: &Path, profile: Option<&str>) -> Result<(), CliError> {
    let settings = sync_settings(profile)?;
    let store = open_store(db_path).await?;
    let replicator = start_replicator(store, settings, SyncConfig::default()).await?;
    let mut events = replicator.subscribe_events();
    println!("Watching {} collection(s); press Ctrl-C to stop", replicator.collections().len());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let outcome = loop {
        tokio::select! {
            result = &mut ctrl_c => break result,
            event = events.recv() => match event {
                Ok(event) => println!("{}", format_event(&event)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {skipped} sync event(s)");
                }
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    replicator.shutdown().await;
    outcome?;
    println!("Stopped");
    Ok(())
}
