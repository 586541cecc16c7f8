//! Error types for the patchguard core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Rollback(#[from] RollbackError),

    #[error(transparent)]
    Change(#[from] ChangeError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Completion(#[from] CompletionError),
}

// ---------------------------------------------------------------------------
// Patch application errors
// ---------------------------------------------------------------------------

/// Hard errors raised by [`PatchApplicator`](crate::apply::PatchApplicator).
///
/// Per-patch failures never surface here; they are recorded in the
/// `ApplicationResult` instead.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The request itself is unusable (missing repository, etc.).
    #[error("invalid application request: {0}")]
    InvalidRequest(String),

    /// Taking the pre-apply snapshot failed.
    #[error("failed to create rollback point: {0}")]
    SnapshotFailed(#[source] RollbackError),

    /// A conflict was hit while the resolution mode is `abort`.
    #[error("patch '{patch_id}' aborted: {source}")]
    ResolutionAborted {
        patch_id: String,
        #[source]
        source: ConflictError,
    },

    /// The apply state machine was driven through an illegal edge.
    #[error("invalid apply state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// The batch failed and restoring the snapshot failed too. Requires
    /// manual intervention.
    #[error("application failed and rollback failed: {source}")]
    RollbackFailed {
        #[source]
        source: RollbackError,
    },

    /// A parallel worker task panicked or was cancelled by the runtime.
    #[error("apply worker failed: {0}")]
    Worker(String),

    /// Generic I/O wrapper.
    #[error("apply I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Conflict resolution errors
// ---------------------------------------------------------------------------

/// Errors from the conflict resolution subsystem.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// Resolution mode `abort` refuses to resolve anything.
    #[error("resolution aborted for file {file}")]
    ResolutionAborted { file: String },

    /// The mode string could not be parsed.
    #[error("unknown conflict resolution mode '{0}'")]
    UnknownMode(String),
}

// ---------------------------------------------------------------------------
// Change application errors
// ---------------------------------------------------------------------------

/// Errors produced while computing the new content of a single file.
#[derive(Debug, Error)]
pub enum ChangeError {
    /// A fragment without line range occurs more than once.
    #[error("ambiguous change in '{path}': fragment occurs {occurrences} times")]
    AmbiguousMatch { path: String, occurrences: usize },

    /// A fragment without line range could not be located.
    #[error("change fragment not found in '{path}'")]
    FragmentNotFound { path: String },

    /// The declared line range lies outside the file.
    #[error("line range {start}-{end} is out of bounds for '{path}' ({len} lines)")]
    LineRange {
        path: String,
        start: usize,
        end: usize,
        len: usize,
    },

    /// A target path escapes the repository root.
    #[error("path '{0}' escapes the repository")]
    PathEscapesRepository(String),

    /// The file to modify or delete does not exist.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// A file to create exists with different content.
    #[error("file already exists: {0}")]
    AlreadyExists(String),

    /// A structured manifest edit could not be performed.
    #[error("config patch on '{path}' failed: {detail}")]
    ConfigPatch { path: String, detail: String },

    /// Generic I/O wrapper.
    #[error("change I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ChangeError {
    /// Whether retrying the same operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::IoError(_))
    }
}

// ---------------------------------------------------------------------------
// Rollback errors
// ---------------------------------------------------------------------------

/// Errors from the snapshot / rollback subsystem.
#[derive(Debug, Error)]
pub enum RollbackError {
    /// The repository path does not exist.
    #[error("repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// No rollback point with the given ID is registered.
    #[error("rollback point not found: {0}")]
    NotFound(String),

    /// The backup directory of a rollback point is gone.
    #[error("backup directory missing: {0}")]
    BackupMissing(String),

    /// The captured revision can no longer be resolved.
    #[error("revision {0} is no longer resolvable")]
    RevisionUnresolvable(String),

    /// Some files could not be restored.
    #[error("rollback incomplete: {restored} restored, {failed} failed: {}", .errors.join("; "))]
    Partial {
        restored: usize,
        failed: usize,
        errors: Vec<String>,
    },

    /// Manifest (de)serialization failure.
    #[error("rollback manifest error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic I/O wrapper.
    #[error("rollback I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// Errors from running validation commands. These are folded into
/// `ValidationResult`s and never returned from `apply_patches`.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The command did not finish within the timeout.
    #[error("command '{command}' timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    /// The command exited with a non-zero status.
    #[error("command '{command}' failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// The command line was empty.
    #[error("empty validation command")]
    EmptyCommand,

    /// Generic I/O wrapper (spawn failure, etc.).
    #[error("validation I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from local Git (git2) operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, tag, SHA) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Completion provider errors
// ---------------------------------------------------------------------------

/// Errors from the external text-completion collaborator.
#[derive(Debug, Error)]
pub enum CompletionError {
    /// HTTP-level transport error (network, TLS, etc.).
    #[error("completion HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The provider returned a non-success status code.
    #[error("completion API error (HTTP {status}): {body}")]
    ApiError { status: u16, body: String },

    /// The response carried no usable text.
    #[error("completion response was empty")]
    EmptyResponse,

    /// The provider is not configured (missing key, etc.).
    #[error("completion provider not configured: {0}")]
    NotConfigured(String),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
