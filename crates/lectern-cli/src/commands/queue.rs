use std::path::Path;

use crate::commands::common::{format_queue_lines, open_store, queue_entry_to_item, QueueItem};
use crate::error::CliError;

pub async fn run_queue(limit: usize, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let entries = store.pending_changes(None, limit).await?;

    if as_json {
        let json_items = entries
            .iter()
            .map(queue_entry_to_item)
            .collect::<Vec<QueueItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No pending changes.");
        return Ok(());
    }

    for line in format_queue_lines(&entries) {
        println!("{line}");
    }
    let total = store.pending_count(None).await?;
    if total > entries.len() {
        println!("... {} more", total - entries.len());
    }
    Ok(())
}
