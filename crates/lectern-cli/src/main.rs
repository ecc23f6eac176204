//! Lectern CLI - inspect and drive the local replica from the terminal

mod cli;
mod commands;
mod config_profiles;
mod error;


use clap::Parser;

use crate::cli::{Cli, Commands, SyncCommands};
use crate::commands::common::resolve_db_path;
use crate::commands::config::run_config;
use crate::commands::docs::{run_delete, run_get, run_put};
use crate::commands::legacy::run_import_legacy;
use crate::commands::queue::run_queue;
use crate::commands::sync::{run_sync, run_sync_conflicts, run_sync_status, run_sync_watch};
use crate::commands::window::run_window;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lectern=info,lectern_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);
    let profile = cli.profile.as_deref();

    match cli.command {
        Commands::Sync { command } => match command {
            None => run_sync(&db_path, profile).await?,
            Some(SyncCommands::Status { json }) => run_sync_status(json, &db_path).await?,
            Some(SyncCommands::Conflicts { limit, json }) => {
                run_sync_conflicts(limit, json, &db_path).await?;
            }
            Some(SyncCommands::Watch) => run_sync_watch(&db_path, profile).await?,
        },
        Commands::Config { command } => run_config(command, profile)?,
        Commands::Window { date } => run_window(date.as_deref(), &db_path, profile).await?,
        Commands::Queue { limit, json } => run_queue(limit, json, &db_path).await?,
        Commands::ImportLegacy { path } => run_import_legacy(&path, &db_path).await?,
        Commands::Get { collection, id } => run_get(&collection, &id, &db_path).await?,
        Commands::Put { collection, json } => {
            run_put(&collection, &json, &db_path, profile).await?;
        }
        Commands::Delete { collection, id } => run_delete(&collection, &id, &db_path).await?,
    }

    Ok(())
}
