//! Patch checks: static pre-apply checks for the conservative strategy and
//! build/test commands run against the working tree.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::config::ValidationConfig;
use crate::conflict::{text, ConflictDetector};
use crate::errors::ValidationError;
use crate::fsio;
use crate::models::{FileOperation, Patch, ValidationKind, ValidationResult};

/// Runs validation checks under one [`ValidationConfig`].
#[derive(Debug, Clone)]
pub struct Validator {
    config: ValidationConfig,
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Whether a patch is too risky for the conservative path on its face.
    pub fn is_risky(&self, patch: &Patch) -> bool {
        patch.confidence < self.config.min_safety_confidence
            || (patch.breaking_change && !self.config.allow_breaking_changes)
    }

    // -----------------------------------------------------------------------
    // Static checks
    // -----------------------------------------------------------------------

    /// Confidence floor, breaking-change policy and target paths.
    pub fn check_safety(&self, patch: &Patch) -> ValidationResult {
        if patch.confidence < self.config.min_safety_confidence {
            return ValidationResult::fail(
                ValidationKind::Safety,
                "confidence below safety threshold",
                format!(
                    "confidence {:.2} < {:.2}",
                    patch.confidence, self.config.min_safety_confidence
                ),
            )
            .for_patch(&patch.id);
        }
        if patch.breaking_change && !self.config.allow_breaking_changes {
            return ValidationResult::fail(
                ValidationKind::Safety,
                "breaking change not allowed",
                "patch is marked as a breaking change",
            )
            .for_patch(&patch.id);
        }
        for path in patch.target_paths() {
            let inside_git = Path::new(&path).components().any(|c| c.as_os_str() == ".git");
            if fsio::join_relative(Path::new("."), &path).is_none() || inside_git {
                return ValidationResult::fail(
                    ValidationKind::Safety,
                    "unsafe target path",
                    format!("'{}' escapes the repository", path),
                )
                .for_patch(&patch.id);
            }
        }
        ValidationResult::pass(ValidationKind::Safety, "patch passes safety checks")
            .for_patch(&patch.id)
    }

    /// New content must not unbalance brackets that were balanced before.
    pub fn check_syntax(&self, patch: &Patch) -> ValidationResult {
        for fp in &patch.file_patches {
            if let Some(content) = &fp.content {
                if !text::brackets_balanced(content) {
                    return ValidationResult::fail(
                        ValidationKind::Syntax,
                        "unbalanced brackets in replacement content",
                        fp.path.clone(),
                    )
                    .for_patch(&patch.id);
                }
            }
            for change in &fp.changes {
                if text::brackets_balanced(&change.old_content)
                    && !text::brackets_balanced(&change.new_content)
                {
                    return ValidationResult::fail(
                        ValidationKind::Syntax,
                        "change introduces unbalanced brackets",
                        format!("{}: {:?}", fp.path, change.new_content),
                    )
                    .for_patch(&patch.id);
                }
            }
        }
        ValidationResult::pass(ValidationKind::Syntax, "syntax checks passed").for_patch(&patch.id)
    }

    /// Every target is in the state its operation expects and every change
    /// can be located.
    pub fn check_semantics(&self, repo: &Path, patch: &Patch) -> ValidationResult {
        let fail = |msg: &str, err: String| {
            ValidationResult::fail(ValidationKind::Semantics, msg, err).for_patch(&patch.id)
        };

        for fp in &patch.file_patches {
            let Some(full) = fsio::join_relative(repo, &fp.path) else {
                return fail("unsafe target path", fp.path.clone());
            };
            match fp.operation {
                FileOperation::Create => {
                    if full.exists() {
                        return fail("file to create already exists", fp.path.clone());
                    }
                }
                FileOperation::Delete => {
                    if !full.is_file() {
                        return fail("file to delete does not exist", fp.path.clone());
                    }
                }
                FileOperation::Modify => {
                    let current = match std::fs::read_to_string(&full) {
                        Ok(c) => c,
                        Err(e) => {
                            let detail = format!("{}: {}", fp.path, e);
                            return fail("file to modify is unreadable", detail);
                        }
                    };
                    if fp.content.is_some() {
                        continue;
                    }
                    for change in &fp.changes {
                        let breaking = patch.breaking_change;
                        if let Err(e) =
                            ConflictDetector::check_change(&fp.path, &current, change, 0, breaking)
                        {
                            return fail("change cannot be located", e.to_string());
                        }
                    }
                }
            }
        }
        for cp in &patch.config_patches {
            match fsio::join_relative(repo, &cp.path) {
                Some(full) if full.is_file() => {}
                _ => return fail("manifest does not exist", cp.path.clone()),
            }
        }
        ValidationResult::pass(ValidationKind::Semantics, "all changes can be located")
            .for_patch(&patch.id)
    }

    /// Static checks plus build/tests when enabled for pre-apply.
    pub async fn pre_apply(&self, repo: &Path, patch: &Patch) -> Vec<ValidationResult> {
        let mut results = vec![
            self.check_safety(patch),
            self.check_syntax(patch),
            self.check_semantics(repo, patch),
        ];
        if self.config.pre_apply_build {
            if let Some(r) = self.run_build(repo).await {
                results.push(r.for_patch(&patch.id));
            }
        }
        if self.config.pre_apply_tests {
            if let Some(r) = self.run_tests(repo).await {
                results.push(r.for_patch(&patch.id));
            }
        }
        results
    }

    /// Build and tests after the batch was written.
    pub async fn post_apply(&self, repo: &Path) -> Vec<ValidationResult> {
        let mut results = Vec::new();
        if let Some(r) = self.run_build(repo).await {
            results.push(r);
        }
        if let Some(r) = self.run_tests(repo).await {
            results.push(r);
        }
        results
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Run the build command. `None` when none is configured.
    pub async fn run_build(&self, repo: &Path) -> Option<ValidationResult> {
        let command = self.config.build_command.as_deref()?;
        Some(self.run_check(repo, ValidationKind::Build, command).await)
    }

    /// Run the test command. `None` when none is configured.
    pub async fn run_tests(&self, repo: &Path) -> Option<ValidationResult> {
        let command = self.config.test_command.as_deref()?;
        Some(self.run_check(repo, ValidationKind::Tests, command).await)
    }

    async fn run_check(
        &self,
        repo: &Path,
        kind: ValidationKind,
        command: &str,
    ) -> ValidationResult {
        let started = Instant::now();
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let result = match run_command(repo, command, timeout).await {
            Ok(_) => ValidationResult::pass(kind, format!("'{}' succeeded", command)),
            Err(e) => {
                warn!(%kind, error = %e, "validation command failed");
                ValidationResult::fail(kind, format!("'{}' failed", command), e.to_string())
            }
        };
        result.with_duration(started.elapsed().as_millis() as u64)
    }
}

/// Run `command_line` through the platform shell in `dir`, killing it once
/// `timeout` elapses. Quoting, pipes and `&&` behave as in a terminal.
/// Returns stdout on success.
#[instrument(skip(dir), fields(dir = %dir.display()))]
pub async fn run_command(
    dir: &Path,
    command_line: &str,
    timeout: Duration,
) -> Result<String, ValidationError> {
    if command_line.trim().is_empty() {
        return Err(ValidationError::EmptyCommand);
    }

    let mut cmd = shell_command(command_line);
    cmd.current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("running validation command");
    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(output) => output?,
        Err(_) => {
            return Err(ValidationError::Timeout {
                command: command_line.to_string(),
                timeout_secs: timeout.as_secs(),
            })
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(ValidationError::CommandFailed {
            command: command_line.to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            stderr,
        });
    }

    info!("validation command succeeded");
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(not(windows))]
fn shell_command(command_line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command_line);
    cmd
}

#[cfg(windows)]
fn shell_command(command_line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command_line);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Change, ChangeKind, FilePatch};

    fn patch(confidence: f64, breaking: bool, path: &str) -> Patch {
        Patch {
            id: "p1".into(),
            file_patches: vec![FilePatch {
                path: path.into(),
                operation: FileOperation::Modify,
                changes: vec![Change {
                    old_content: "version = \"1.0\"".into(),
                    new_content: "version = \"2.0\"".into(),
                    line_start: 0,
                    line_end: 0,
                    kind: ChangeKind::Dependency,
                    reason: String::new(),
                    confidence: 1.0,
                }],
                content: None,
                confidence: 1.0,
                description: String::new(),
            }],
            config_patches: Vec::new(),
            confidence,
            breaking_change: breaking,
            description: None,
        }
    }

    fn validator() -> Validator {
        Validator::new(ValidationConfig::default())
    }

    #[test]
    fn test_safety() {
        let v = validator();
        assert!(v.check_safety(&patch(0.9, false, "Cargo.toml")).passed);
        assert!(!v.check_safety(&patch(0.5, false, "Cargo.toml")).passed);
        assert!(!v.check_safety(&patch(0.9, true, "Cargo.toml")).passed);
        assert!(!v.check_safety(&patch(0.9, false, "../outside")).passed);
        assert!(!v.check_safety(&patch(0.9, false, ".git/config")).passed);
        assert!(v.is_risky(&patch(0.9, true, "Cargo.toml")));
    }

    #[test]
    fn test_syntax_flags_new_imbalance() {
        let mut p = patch(0.9, false, "a.rs");
        p.file_patches[0].changes[0].new_content = "call(".into();
        let r = validator().check_syntax(&p);
        assert!(!r.passed);
        assert_eq!(r.patch_id.as_deref(), Some("p1"));
    }

    #[test]
    fn test_semantics() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "version = \"1.0\"\n").unwrap();
        let v = validator();
        assert!(v.check_semantics(dir.path(), &patch(0.9, false, "Cargo.toml")).passed);
        assert!(!v.check_semantics(dir.path(), &patch(0.9, false, "missing.toml")).passed);

        std::fs::write(dir.path().join("Cargo.toml"), "name = \"x\"\n").unwrap();
        assert!(!v.check_semantics(dir.path(), &patch(0.9, false, "Cargo.toml")).passed);
    }

    #[tokio::test]
    async fn test_empty_command() {
        let err = run_command(Path::new("."), "  ", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ValidationError::EmptyCommand));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run_command(dir.path(), "true", Duration::from_secs(5)).await.is_ok());
        assert!(matches!(
            run_command(dir.path(), "false", Duration::from_secs(5)).await,
            Err(ValidationError::CommandFailed { exit_code: 1, .. })
        ));
        assert!(matches!(
            run_command(dir.path(), "sleep 5", Duration::from_millis(100)).await,
            Err(ValidationError::Timeout { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_keeps_quoted_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_command(dir.path(), "printf '%s|' \"a b\" c", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, "a b|c|");
    }

    #[tokio::test]
    async fn test_unconfigured_commands_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validator().post_apply(dir.path()).await.is_empty());
    }
}
