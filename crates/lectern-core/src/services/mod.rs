//! Services layer for Lectern

mod store;

pub use store::{LocalStore, PageCommit};
