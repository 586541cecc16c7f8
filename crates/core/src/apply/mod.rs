//! Patch application.
//!
//! - [`applicator`] orchestrates a patch set: snapshot, strategy, validation,
//!   rollback.
//! - [`changes`] plans and writes the edits of a single patch.
//! - [`config_patch`] edits dependency manifests structurally.
//! - [`grouping`] splits a patch set into file-disjoint waves.

pub mod applicator;
pub(crate) mod changes;
pub mod config_patch;
pub mod grouping;

pub use applicator::{CompletionListener, PatchApplicator};
pub use config_patch::apply_config_patch;
pub use grouping::plan_waves;
