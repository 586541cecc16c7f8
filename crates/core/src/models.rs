//! Domain model types shared by the applicator, resolver and CLI.
//!
//! Everything here is plain data: requests come in as JSON from a batch
//! caller, results go back out the same way.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::conflict::{Conflict, ResolutionMode};
use crate::errors::ConfigError;
use crate::fsio;
use crate::rollback::RollbackReport;

// ---------------------------------------------------------------------------
// Patches
// ---------------------------------------------------------------------------

/// A bundle of file and manifest changes for one dependency update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub id: String,
    #[serde(default)]
    pub file_patches: Vec<FilePatch>,
    #[serde(default)]
    pub config_patches: Vec<ConfigPatch>,
    /// Generator confidence in `0.0..=1.0`.
    pub confidence: f64,
    #[serde(default)]
    pub breaking_change: bool,
    #[serde(default)]
    pub description: Option<String>,
}

impl Patch {
    /// Every repository-relative path this patch writes to, normalised.
    pub fn target_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .file_patches
            .iter()
            .map(|fp| fsio::normalize_relative(&fp.path))
            .chain(self.config_patches.iter().map(|cp| fsio::normalize_relative(&cp.path)))
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }
}

/// What a [`FilePatch`] does to its target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Create,
    Modify,
    Delete,
}

impl std::fmt::Display for FileOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Modify => write!(f, "modify"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Changes to a single file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePatch {
    /// Repository-relative path.
    pub path: String,
    pub operation: FileOperation,
    /// Applied in list order.
    #[serde(default)]
    pub changes: Vec<Change>,
    /// Full replacement content. Takes precedence over `changes`.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub description: String,
}

fn default_confidence() -> f64 {
    1.0
}

/// Category of a single change, as reported by the generator.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Dependency,
    Import,
    Api,
    Configuration,
    Syntax,
    #[default]
    #[serde(other)]
    Other,
}

/// One expected-before / after replacement inside a file.
///
/// `line_start`/`line_end` are 1-indexed and inclusive. A `line_start` of 0
/// means the generator gave no range and `old_content` must occur exactly
/// once in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub old_content: String,
    pub new_content: String,
    #[serde(default)]
    pub line_start: usize,
    #[serde(default)]
    pub line_end: usize,
    #[serde(default)]
    pub kind: ChangeKind,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

impl Change {
    /// Whether the change pins an explicit line range.
    pub fn has_range(&self) -> bool {
        self.line_start > 0
    }
}

/// Manifest format targeted by a [`ConfigPatch`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfigType {
    PackageJson,
    CargoToml,
    GoMod,
    RequirementsTxt,
    Json,
    Toml,
}

impl std::fmt::Display for ConfigType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PackageJson => write!(f, "package_json"),
            Self::CargoToml => write!(f, "cargo_toml"),
            Self::GoMod => write!(f, "go_mod"),
            Self::RequirementsTxt => write!(f, "requirements_txt"),
            Self::Json => write!(f, "json"),
            Self::Toml => write!(f, "toml"),
        }
    }
}

/// Structured edits to a dependency manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub path: String,
    pub config_type: ConfigType,
    /// Dotted field path (or package name for line-based manifests) to the
    /// new value.
    #[serde(default)]
    pub changes: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// How a patch set is scheduled.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStrategy {
    #[default]
    Sequential,
    Parallel,
    Optimized,
    Conservative,
    /// Picks one of the others per request.
    Adaptive,
}

impl std::fmt::Display for ApplicationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel => write!(f, "parallel"),
            Self::Optimized => write!(f, "optimized"),
            Self::Conservative => write!(f, "conservative"),
            Self::Adaptive => write!(f, "adaptive"),
        }
    }
}

impl FromStr for ApplicationStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            "optimized" => Ok(Self::Optimized),
            "conservative" => Ok(Self::Conservative),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(ConfigError::InvalidValue {
                field: "strategy".into(),
                detail: format!("unknown application strategy '{}'", other),
            }),
        }
    }
}

/// Per-request switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationOptions {
    pub dry_run: bool,
    pub auto_resolve_conflicts: bool,
    pub create_backup: bool,
    pub validate_after_apply: bool,
    pub rollback_on_failure: bool,
    /// Extra attempts for transient write failures.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub conflict_resolution: ResolutionMode,
    pub notify_on_completion: bool,
    /// Concurrent patches per wave on the parallel path. 0 = unbounded.
    pub max_parallelism: usize,
}

impl Default for ApplicationOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            auto_resolve_conflicts: true,
            create_backup: true,
            validate_after_apply: false,
            rollback_on_failure: true,
            max_retries: 2,
            retry_delay_ms: 100,
            conflict_resolution: ResolutionMode::Auto,
            notify_on_completion: false,
            max_parallelism: 0,
        }
    }
}

/// Input to [`PatchApplicator::apply_patches`](crate::apply::PatchApplicator::apply_patches).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationRequest {
    pub repo_path: std::path::PathBuf,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub patches: Vec<Patch>,
    #[serde(default)]
    pub strategy: ApplicationStrategy,
    #[serde(default)]
    pub options: ApplicationOptions,
}

fn default_branch() -> String {
    "main".into()
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// States of a single `apply_patches` invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplyState {
    Pending,
    SnapshotTaken,
    Applying,
    Validating,
    RolledBack,
    Done,
}

impl ApplyState {
    /// Whether `self -> next` is a legal edge.
    pub fn can_transition_to(self, next: ApplyState) -> bool {
        use ApplyState::*;
        matches!(
            (self, next),
            (Pending, SnapshotTaken)
                | (Pending, Applying)
                | (SnapshotTaken, Applying)
                | (Applying, Validating)
                | (Applying, RolledBack)
                | (Applying, Done)
                | (Validating, RolledBack)
                | (Validating, Done)
                | (RolledBack, Done)
        )
    }
}

impl std::fmt::Display for ApplyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::SnapshotTaken => write!(f, "snapshot_taken"),
            Self::Applying => write!(f, "applying"),
            Self::Validating => write!(f, "validating"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// A patch that was written (or would have been, on a dry run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedPatch {
    pub patch_id: String,
    pub files_changed: Vec<String>,
    /// Every conflict here carries a resolution.
    pub conflicts: Vec<Conflict>,
    pub duration_ms: u64,
    pub attempts: u32,
    /// Unified diff of the planned writes. Dry runs only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

/// Why a patch ended up in [`ApplicationResult::failed`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ApplicationError,
    ValidationFailed,
    UnresolvedConflicts,
    ManualResolutionRequired,
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApplicationError => write!(f, "application_error"),
            Self::ValidationFailed => write!(f, "validation_failed"),
            Self::UnresolvedConflicts => write!(f, "unresolved_conflicts"),
            Self::ManualResolutionRequired => write!(f, "manual_resolution_required"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A patch that was not written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedPatch {
    pub patch_id: String,
    pub reason: FailureReason,
    pub error: String,
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
}

/// Kind of check behind a [`ValidationResult`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    Safety,
    Syntax,
    Semantics,
    Build,
    Tests,
}

impl std::fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Safety => write!(f, "safety"),
            Self::Syntax => write!(f, "syntax"),
            Self::Semantics => write!(f, "semantics"),
            Self::Build => write!(f, "build"),
            Self::Tests => write!(f, "tests"),
        }
    }
}

/// Outcome of one validation check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub kind: ValidationKind,
    pub passed: bool,
    pub message: String,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Set for pre-apply checks of a specific patch.
    #[serde(default)]
    pub patch_id: Option<String>,
}

impl ValidationResult {
    pub fn pass(kind: ValidationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            passed: true,
            message: message.into(),
            error: None,
            duration_ms: 0,
            patch_id: None,
        }
    }

    pub fn fail(
        kind: ValidationKind,
        message: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            passed: false,
            message: message.into(),
            error: Some(error.into()),
            duration_ms: 0,
            patch_id: None,
        }
    }

    pub fn for_patch(mut self, patch_id: &str) -> Self {
        self.patch_id = Some(patch_id.to_string());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Counts and success rate of one invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApplicationSummary {
    pub total_patches: usize,
    pub applied_count: usize,
    pub failed_count: usize,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    pub files_changed: usize,
    pub success_rate: f64,
}

/// Batches above this success rate count as successful.
pub const SUCCESS_THRESHOLD: f64 = 0.8;

impl ApplicationSummary {
    /// Derive the summary from the per-patch outcomes.
    pub fn compute(
        applied: &[AppliedPatch],
        failed: &[FailedPatch],
        conflicts: &[Conflict],
    ) -> Self {
        let applied_count = applied.len();
        let failed_count = failed.len();
        let attempted = applied_count + failed_count;
        let success_rate = if attempted == 0 {
            1.0
        } else {
            applied_count as f64 / attempted as f64
        };

        Self {
            total_patches: attempted,
            applied_count,
            failed_count,
            conflicts_detected: conflicts.len(),
            conflicts_resolved: conflicts.iter().filter(|c| c.is_resolved()).count(),
            files_changed: applied.iter().map(|a| a.files_changed.len()).sum(),
            success_rate,
        }
    }

    pub fn is_success(&self) -> bool {
        self.success_rate > SUCCESS_THRESHOLD
    }
}

/// Everything `apply_patches` has to say about one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationResult {
    pub success: bool,
    pub strategy: ApplicationStrategy,
    pub state: ApplyState,
    pub state_history: Vec<ApplyState>,
    pub applied: Vec<AppliedPatch>,
    pub failed: Vec<FailedPatch>,
    pub conflicts: Vec<Conflict>,
    pub validation_results: Vec<ValidationResult>,
    pub rollback_point_id: Option<String>,
    pub rolled_back: bool,
    pub rollback_report: Option<RollbackReport>,
    pub duration_ms: u64,
    pub summary: ApplicationSummary,
    pub recommendations: Vec<String>,
}

impl ApplicationResult {
    pub fn applied_ids(&self) -> Vec<&str> {
        self.applied.iter().map(|a| a.patch_id.as_str()).collect()
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.patch_id.as_str()).collect()
    }
}
