//! Planning and writing the edits of one patch.
//!
//! Planning reads every target, checks each change, resolves conflicts and
//! stages the resulting file contents in memory. Nothing touches the disk
//! until [`PatchPlan::write`], so a refused or failed plan leaves the tree
//! as it was.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use super::config_patch::apply_config_patch;
use crate::conflict::detector::strip_terminator;
use crate::conflict::{
    ChangeCheck, Conflict, ConflictDetector, ConflictResolver, Location, ResolutionMode,
};
use crate::errors::{ChangeError, ConflictError};
use crate::fsio;
use crate::models::{Change, FailureReason, FileOperation, FilePatch, Patch};

/// One file's before and after. `None` means absent.
#[derive(Debug, Clone)]
pub(crate) struct StagedFile {
    pub full_path: PathBuf,
    pub original: Option<String>,
    pub current: Option<String>,
}

impl StagedFile {
    fn is_changed(&self) -> bool {
        self.original != self.current
    }
}

/// Everything a patch would write.
#[derive(Debug, Default)]
pub(crate) struct PatchPlan {
    pub files: BTreeMap<String, StagedFile>,
    /// Conflicts met while planning, each carrying its resolution.
    pub conflicts: Vec<Conflict>,
}

/// Why a plan could not be produced.
#[derive(Debug)]
pub(crate) enum PlanError {
    Change(ChangeError),
    /// Conflicts that were left open or only got a manual placeholder.
    Unresolved {
        reason: FailureReason,
        conflicts: Vec<Conflict>,
    },
    /// The resolution mode refused; the whole invocation must stop.
    Aborted {
        source: ConflictError,
        conflicts: Vec<Conflict>,
    },
}

impl From<ChangeError> for PlanError {
    fn from(e: ChangeError) -> Self {
        PlanError::Change(e)
    }
}

/// Builds [`PatchPlan`]s against one repository.
pub(crate) struct Planner<'a> {
    pub repo: &'a Path,
    pub resolver: &'a ConflictResolver,
    pub mode: ResolutionMode,
    pub auto_resolve: bool,
}

#[derive(Default)]
struct ConflictLedger {
    resolved: Vec<Conflict>,
    open: Vec<Conflict>,
    manual: Vec<Conflict>,
}

impl ConflictLedger {
    fn all(self) -> Vec<Conflict> {
        let mut all = self.resolved;
        all.extend(self.open);
        all.extend(self.manual);
        all
    }
}

impl<'a> Planner<'a> {
    pub async fn plan(&self, patch: &Patch) -> Result<PatchPlan, PlanError> {
        let mut files: BTreeMap<String, StagedFile> = BTreeMap::new();
        let mut ledger = ConflictLedger::default();

        for fp in &patch.file_patches {
            let staged = self.stage(&mut files, &fp.path)?;
            let next = match self
                .apply_file_patch(fp, staged.current.as_deref(), patch.breaking_change, &mut ledger)
                .await
            {
                Ok(next) => next,
                Err(PlanError::Aborted { source, mut conflicts }) => {
                    let mut all = ledger.all();
                    all.append(&mut conflicts);
                    return Err(PlanError::Aborted {
                        source,
                        conflicts: all,
                    });
                }
                Err(other) => return Err(other),
            };
            if let Some(staged) = files.get_mut(&fsio::normalize_relative(&fp.path)) {
                staged.current = next;
            }
        }

        for cp in &patch.config_patches {
            let staged = self.stage(&mut files, &cp.path)?;
            let current = staged
                .current
                .as_deref()
                .ok_or_else(|| ChangeError::FileNotFound(cp.path.clone()))?;
            let next = apply_config_patch(current, cp)?;
            if let Some(staged) = files.get_mut(&fsio::normalize_relative(&cp.path)) {
                staged.current = Some(next);
            }
        }

        if !ledger.open.is_empty() || !ledger.manual.is_empty() {
            let reason = if ledger.manual.is_empty() {
                FailureReason::UnresolvedConflicts
            } else {
                FailureReason::ManualResolutionRequired
            };
            return Err(PlanError::Unresolved {
                reason,
                conflicts: ledger.all(),
            });
        }

        Ok(PatchPlan {
            files,
            conflicts: ledger.resolved,
        })
    }

    /// Load `rel` into the staging map if it is not there yet and return a
    /// snapshot of its staged state.
    fn stage(
        &self,
        files: &mut BTreeMap<String, StagedFile>,
        rel: &str,
    ) -> Result<StagedFile, ChangeError> {
        let key = fsio::normalize_relative(rel);
        if let Some(staged) = files.get(&key) {
            return Ok(staged.clone());
        }
        let full_path = fsio::join_relative(self.repo, rel)
            .ok_or_else(|| ChangeError::PathEscapesRepository(rel.to_string()))?;
        let original = match std::fs::read_to_string(&full_path) {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let staged = StagedFile {
            full_path,
            current: original.clone(),
            original,
        };
        files.insert(key, staged.clone());
        Ok(staged)
    }

    async fn apply_file_patch(
        &self,
        fp: &FilePatch,
        current: Option<&str>,
        breaking: bool,
        ledger: &mut ConflictLedger,
    ) -> Result<Option<String>, PlanError> {
        match fp.operation {
            FileOperation::Create => {
                let content = fp.content.clone().unwrap_or_else(|| {
                    let mut joined = fp
                        .changes
                        .iter()
                        .map(|c| strip_terminator(&c.new_content))
                        .collect::<Vec<_>>()
                        .join("\n");
                    if !joined.is_empty() {
                        joined.push('\n');
                    }
                    joined
                });
                match current {
                    Some(existing) if existing != content => {
                        Err(ChangeError::AlreadyExists(fp.path.clone()).into())
                    }
                    _ => Ok(Some(content)),
                }
            }
            FileOperation::Delete => match current {
                Some(_) => Ok(None),
                None => Err(ChangeError::FileNotFound(fp.path.clone()).into()),
            },
            FileOperation::Modify => {
                let Some(text) = current else {
                    return Err(ChangeError::FileNotFound(fp.path.clone()).into());
                };
                if let Some(content) = &fp.content {
                    return Ok(Some(content.clone()));
                }
                self.apply_changes(&fp.path, text, &fp.changes, breaking, ledger)
                    .await
                    .map(Some)
            }
        }
    }

    async fn apply_changes(
        &self,
        path: &str,
        original: &str,
        changes: &[Change],
        breaking: bool,
        ledger: &mut ConflictLedger,
    ) -> Result<String, PlanError> {
        let mut text = original.to_string();
        let mut offset: isize = 0;

        for change in changes {
            let check = ConflictDetector::check_change(path, &text, change, offset, breaking)?;
            let (location, replacement) = match check {
                ChangeCheck::Clean(location) => {
                    (location, strip_terminator(&change.new_content).to_string())
                }
                ChangeCheck::AlreadyApplied => {
                    debug!(path, "skipping change that is already applied");
                    continue;
                }
                ChangeCheck::Conflict { conflict, location } => {
                    let mut conflict = *conflict;
                    if !self.auto_resolve {
                        ledger.open.push(conflict);
                        continue;
                    }
                    let resolution = match self.resolver.resolve(&conflict, self.mode).await {
                        Ok(resolution) => resolution,
                        Err(source) => {
                            return Err(PlanError::Aborted {
                                source,
                                conflicts: vec![conflict],
                            })
                        }
                    };
                    let placeholder = resolution.is_placeholder();
                    let chosen = resolution.chosen_text.clone();
                    conflict.resolution = Some(resolution);
                    if placeholder {
                        ledger.manual.push(conflict);
                        continue;
                    }
                    ledger.resolved.push(conflict);
                    (location, chosen)
                }
            };

            let (next, delta) = splice(&text, location, &replacement);
            text = next;
            if change.has_range() {
                offset += delta;
            }
        }
        Ok(text)
    }
}

/// Replace `location` in `text` and return the new text with the change in
/// line count.
pub(crate) fn splice(text: &str, location: Location, replacement: &str) -> (String, isize) {
    let (start, mut end) = (location.start, location.end);

    let inserted = if location.insertion {
        if start == text.len() && !text.is_empty() && !text.ends_with('\n') {
            format!("\n{}", replacement)
        } else {
            format!("{}\n", replacement)
        }
    } else {
        // Emptying whole lines removes them.
        let at_line_start = start == 0 || text.as_bytes()[start - 1] == b'\n';
        if replacement.is_empty() && at_line_start && start < end {
            let rest = &text[end..];
            if rest.starts_with("\r\n") {
                end += 2;
            } else if rest.starts_with('\n') {
                end += 1;
            }
        }
        replacement.to_string()
    };

    let removed_lines = text[start..end].matches('\n').count() as isize;
    let added_lines = inserted.matches('\n').count() as isize;

    let mut out = String::with_capacity(text.len() + inserted.len());
    out.push_str(&text[..start]);
    out.push_str(&inserted);
    out.push_str(&text[end..]);
    (out, added_lines - removed_lines)
}

impl PatchPlan {
    /// Repository-relative paths whose content would change.
    pub fn changed_paths(&self) -> Vec<String> {
        self.files
            .iter()
            .filter(|(_, f)| f.is_changed())
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Unified diff of every staged change.
    pub fn preview(&self) -> String {
        let mut out = String::new();
        for (path, staged) in self.files.iter().filter(|(_, f)| f.is_changed()) {
            let before = staged.original.as_deref().unwrap_or("");
            let after = staged.current.as_deref().unwrap_or("");
            let old_name = match staged.original {
                Some(_) => format!("a/{}", path),
                None => "/dev/null".into(),
            };
            let new_name = match staged.current {
                Some(_) => format!("b/{}", path),
                None => "/dev/null".into(),
            };

            let patch = diffy::create_patch(before, after).to_string();
            out.push_str(&format!("--- {}\n+++ {}\n", old_name, new_name));
            // Drop diffy's own `--- original` / `+++ modified` header.
            for line in patch.lines().skip(2) {
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }

    /// Write every changed file, retrying transient failures. On a hard
    /// failure the files already written by this call are put back.
    ///
    /// Returns the changed paths and the highest attempt count any file
    /// needed.
    pub async fn write(
        &self,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<(Vec<String>, u32), ChangeError> {
        let mut written: Vec<&StagedFile> = Vec::new();
        let mut max_attempts = 1;

        for (path, staged) in self.files.iter().filter(|(_, f)| f.is_changed()) {
            match write_with_retry(staged, max_retries, retry_delay).await {
                Ok(attempts) => {
                    max_attempts = max_attempts.max(attempts);
                    written.push(staged);
                }
                Err(e) => {
                    warn!(
                        path = %path,
                        error = %e,
                        "write failed, reverting this patch's earlier writes"
                    );
                    for done in written {
                        if let Err(revert) = put_back(done) {
                            warn!(
                                path = %done.full_path.display(),
                                error = %revert,
                                "revert failed"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok((self.changed_paths(), max_attempts))
    }
}

async fn write_with_retry(
    staged: &StagedFile,
    max_retries: u32,
    retry_delay: Duration,
) -> Result<u32, ChangeError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match &staged.current {
            Some(content) => fsio::write_atomic(&staged.full_path, content.as_bytes()),
            None => remove_existing(&staged.full_path),
        };
        match result.map_err(ChangeError::from) {
            Ok(()) => return Ok(attempt),
            Err(e) if e.is_transient() && attempt <= max_retries => {
                debug!(path = %staged.full_path.display(), attempt, error = %e, "retrying write");
                tokio::time::sleep(retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn put_back(staged: &StagedFile) -> std::io::Result<()> {
    match &staged.original {
        Some(content) => fsio::write_atomic(&staged.full_path, content.as_bytes()),
        None => remove_existing(&staged.full_path),
    }
}

fn remove_existing(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeKind, ConfigPatch, ConfigType};

    fn change(old: &str, new: &str, start: usize, end: usize) -> Change {
        Change {
            old_content: old.into(),
            new_content: new.into(),
            line_start: start,
            line_end: end,
            kind: ChangeKind::Dependency,
            reason: String::new(),
            confidence: 0.9,
        }
    }

    fn file_patch(path: &str, operation: FileOperation, changes: Vec<Change>) -> FilePatch {
        FilePatch {
            path: path.into(),
            operation,
            changes,
            content: None,
            confidence: 1.0,
            description: String::new(),
        }
    }

    fn patch(file_patches: Vec<FilePatch>) -> Patch {
        Patch {
            id: "p".into(),
            file_patches,
            config_patches: Vec::new(),
            confidence: 0.9,
            breaking_change: false,
            description: None,
        }
    }

    #[test]
    fn test_splice_replace_and_delete_lines() {
        let text = "a\nb\nc\n";
        let loc = Location { start: 2, end: 3, line: 2, insertion: false };
        assert_eq!(splice(text, loc, "B1\nB2"), ("a\nB1\nB2\nc\n".to_string(), 1));
        assert_eq!(splice(text, loc, ""), ("a\nc\n".to_string(), -1));
    }

    #[test]
    fn test_splice_insertions() {
        let loc = Location { start: 2, end: 2, line: 2, insertion: true };
        assert_eq!(splice("a\nb\n", loc, "x"), ("a\nx\nb\n".to_string(), 1));
        let eof = Location { start: 3, end: 3, line: 3, insertion: true };
        assert_eq!(splice("a\nb", eof, "x"), ("a\nb\nx".to_string(), 1));
    }

    #[tokio::test]
    async fn test_plan_offsets_later_ranges() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("deps.txt"), "one\ntwo\nthree\n").unwrap();
        let resolver = ConflictResolver::new();
        let planner = Planner {
            repo: dir.path(),
            resolver: &resolver,
            mode: ResolutionMode::Auto,
            auto_resolve: true,
        };

        let p = patch(vec![file_patch(
            "deps.txt",
            FileOperation::Modify,
            vec![change("one", "one\none-b", 1, 1), change("three", "THREE", 3, 3)],
        )]);
        let plan = planner.plan(&p).await.unwrap();
        assert_eq!(
            plan.files["deps.txt"].current.as_deref(),
            Some("one\none-b\ntwo\nTHREE\n")
        );
        assert!(plan.conflicts.is_empty());
        assert!(plan.preview().contains("+THREE"));
    }

    #[tokio::test]
    async fn test_plan_records_open_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "version = 3\n").unwrap();
        let resolver = ConflictResolver::new();
        let planner = Planner {
            repo: dir.path(),
            resolver: &resolver,
            mode: ResolutionMode::Auto,
            auto_resolve: false,
        };

        let p = patch(vec![file_patch(
            "a.txt",
            FileOperation::Modify,
            vec![change("version = 1", "version = 2", 1, 1)],
        )]);
        match planner.plan(&p).await {
            Err(PlanError::Unresolved { reason, conflicts }) => {
                assert_eq!(reason, FailureReason::UnresolvedConflicts);
                assert_eq!(conflicts.len(), 1);
            }
            other => panic!("expected unresolved, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_plan_create_delete_and_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.txt"), "bye\n").unwrap();
        let manifest = "{\"dependencies\":{\"a\":\"1\"}}";
        std::fs::write(dir.path().join("package.json"), manifest).unwrap();
        let resolver = ConflictResolver::new();
        let planner = Planner {
            repo: dir.path(),
            resolver: &resolver,
            mode: ResolutionMode::Auto,
            auto_resolve: true,
        };

        let mut p = patch(vec![
            file_patch("new/hello.txt", FileOperation::Create, vec![change("", "hello", 0, 0)]),
            file_patch("old.txt", FileOperation::Delete, Vec::new()),
        ]);
        p.config_patches.push(ConfigPatch {
            path: "package.json".into(),
            config_type: ConfigType::PackageJson,
            changes: serde_json::json!({"dependencies.a": "2"}).as_object().cloned().unwrap(),
        });

        let plan = planner.plan(&p).await.unwrap();
        assert_eq!(plan.changed_paths(), vec!["new/hello.txt", "old.txt", "package.json"]);

        let (changed, attempts) = plan.write(0, Duration::from_millis(1)).await.unwrap();
        assert_eq!(changed.len(), 3);
        assert_eq!(attempts, 1);
        assert_eq!(std::fs::read_to_string(dir.path().join("new/hello.txt")).unwrap(), "hello\n");
        assert!(!dir.path().join("old.txt").exists());
        assert!(std::fs::read_to_string(dir.path().join("package.json"))
            .unwrap()
            .contains("\"a\": \"2\""));
    }

    #[tokio::test]
    async fn test_plan_rejects_escaping_path() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ConflictResolver::new();
        let planner = Planner {
            repo: dir.path(),
            resolver: &resolver,
            mode: ResolutionMode::Auto,
            auto_resolve: true,
        };
        let p = patch(vec![file_patch("../evil.txt", FileOperation::Create, Vec::new())]);
        assert!(matches!(
            planner.plan(&p).await,
            Err(PlanError::Change(ChangeError::PathEscapesRepository(_)))
        ));
    }
}
