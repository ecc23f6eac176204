pub mod common;
pub mod config;
pub mod docs;
pub mod legacy;
pub mod queue;
pub mod sync;
pub mod window;
