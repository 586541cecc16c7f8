//! Snapshots of a working tree and restoring them.
//!
//! A rollback point records every regular file (SHA-256 digest, size,
//! permission bits, modification time) and copies it under
//! `<repo>/<backup root>/<id>/`, with a JSON manifest next to it at
//! `<repo>/<backup root>/<id>.json`.

pub mod manager;
pub mod snapshot;
pub mod store;

pub use manager::{RollbackManager, RollbackMethod, RollbackReport};
pub use snapshot::{digest, FileState, RollbackPoint};
pub use store::RollbackStore;
