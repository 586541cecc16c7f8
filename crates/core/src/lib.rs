//! patchguard core library.
//!
//! This crate decides whether a set of generated dependency-update changes
//! can be written to a repository, writes them, and undoes the write when
//! the batch fails: conflict detection and resolution, patch application
//! strategies, validation and snapshot rollback.

pub mod ai;
pub mod apply;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod errors;
pub mod fsio;
pub mod git;
pub mod models;
pub mod rollback;
pub mod validation;

// Re-exports for convenience.
pub use apply::PatchApplicator;
pub use cancel::CancellationToken;
pub use config::AppConfig;
pub use conflict::{analyze_risk, ConflictResolver, RiskAnalysis};
pub use rollback::RollbackManager;
pub use validation::Validator;
