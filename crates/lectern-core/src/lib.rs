//! lectern-core - Core library for Lectern
//!
//! This crate contains the local store, the collection schema registry,
//! windowing, and the replication engine that mirrors a bounded subset of a
//! Supabase/PostgREST backend on the device. The CLI and app shells build on
//! [`LocalStore`] and [`Replicator`].

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod schema;
pub mod services;
pub mod sync;
pub mod util;
pub mod window;

pub use config::{RemoteConfig, RetryConfig, SyncConfig};
pub use error::{Error, Result};
pub use models::{Document, Payload};
pub use remote::{MemoryRemote, PostgrestRemote, RemoteStore};
pub use services::LocalStore;
pub use sync::{Replicator, SyncEvent, SyncReport, SyncState};
