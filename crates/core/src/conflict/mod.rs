//! Conflict detection, resolution and risk analysis.
//!
//! The conflict subsystem is responsible for:
//! 1. **Detection** -- checking a change's expected content against the file.
//! 2. **Resolution** -- choosing the text to write under a resolution mode.
//! 3. **Risk** -- summarising a conflict set into one verdict.

pub mod detector;
pub mod lines;
pub mod resolver;
pub mod risk;
pub mod text;
pub mod types;

pub use detector::{ChangeCheck, ConflictDetector, Location};
pub use resolver::{auto_resolve, ConflictResolver};
pub use risk::{analyze_risk, RiskAnalysis};
pub use types::{
    Conflict, ConflictResolution, ConflictType, ResolutionMode, Severity,
    MANUAL_RESOLUTION_REQUIRED,
};
