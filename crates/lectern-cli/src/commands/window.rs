use std::path::Path;

use lectern_core::models::Preferences;
use lectern_core::schema::COLLECTIONS;
use lectern_core::window::{compute_window, WindowReference};
use lectern_core::SyncConfig;

use crate::commands::common::{open_store, parse_date, resolve_user_id};
use crate::error::CliError;

/// One line per collection: name and window key.
pub fn window_lines(reference: &WindowReference, config: &SyncConfig) -> Vec<String> {
    COLLECTIONS
        .iter()
        .map(|schema| {
            let window = compute_window(schema.window, reference, config);
            format!("{:<18} {}", schema.name, window.key())
        })
        .collect()
}

pub async fn run_window(
    date: Option<&str>,
    db_path: &Path,
    profile: Option<&str>,
) -> Result<(), CliError> {
    let today = parse_date(date)?;
    let preferences = match resolve_user_id(profile)? {
        Some(user_id) => open_store(db_path).await?.preferences(&user_id).await?,
        None => Preferences::default(),
    };

    println!(
        "Date {today}, position {} ({})",
        preferences.position,
        preferences.pace.as_str()
    );
    let reference = WindowReference { today, preferences };
    for line in window_lines(&reference, &SyncConfig::default()) {
        println!("{line}");
    }
    Ok(())
}
