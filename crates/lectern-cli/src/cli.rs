use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "lectern")]
#[command(about = "Offline-first study replica with incremental sync")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// CLI profile name for remote configuration
    #[arg(long, global = true, value_name = "NAME")]
    pub profile: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Push local changes and pull every collection
    Sync {
        #[command(subcommand)]
        command: Option<SyncCommands>,
    },
    /// Configure CLI profiles
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Show each collection's current window
    Window {
        /// Reference date (YYYY-MM-DD, defaults to today)
        #[arg(long, value_name = "DATE")]
        date: Option<String>,
    },
    /// List pending change-queue entries
    Queue {
        /// Number of entries to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Import documents from an older on-device store
    ImportLegacy {
        /// Path to the legacy SQLite file
        path: PathBuf,
    },
    /// Print a local document as JSON
    Get {
        collection: String,
        id: String,
    },
    /// Insert or update a local document
    Put {
        collection: String,
        /// Document fields as a JSON object; an existing `id` updates in place
        json: String,
    },
    /// Delete a local document
    Delete {
        collection: String,
        id: String,
    },
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Show checkpoints, pending counts and whether a sync is due
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recently resolved sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Keep replicating until Ctrl-C, printing events
    Watch,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Initialize or update profile config
    Init {
        /// Profile name to initialize
        #[arg(long, value_name = "NAME")]
        profile: Option<String>,
        /// Supabase project URL
        #[arg(long, value_name = "URL")]
        supabase_url: Option<String>,
        /// Supabase anon/public key
        #[arg(long, value_name = "KEY")]
        supabase_anon_key: Option<String>,
        /// User whose rows this device mirrors
        #[arg(long, value_name = "ID")]
        user_id: Option<String>,
        /// Keep current active profile instead of activating this one
        #[arg(long)]
        no_activate: bool,
    },
}
