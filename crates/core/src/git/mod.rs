//! Version-control boundary used by snapshots and rollback.

pub mod client;

pub use client::GitClient;
