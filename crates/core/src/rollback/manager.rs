//! Creating, restoring and housekeeping rollback points.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::snapshot::{capture_file, digest, walk_tree, FileState, RollbackPoint};
use super::store::RollbackStore;
use crate::clock::{Clock, SystemClock};
use crate::config::RollbackConfig;
use crate::errors::RollbackError;
use crate::fsio;
use crate::git::GitClient;

/// How a rollback brought the tree back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RollbackMethod {
    VcsReset,
    FileRestore,
}

impl std::fmt::Display for RollbackMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VcsReset => write!(f, "vcs_reset"),
            Self::FileRestore => write!(f, "file_restore"),
        }
    }
}

/// What a successful rollback did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackReport {
    pub point_id: String,
    pub method: RollbackMethod,
    /// Files rewritten from the snapshot.
    pub restored: usize,
    /// Files deleted because they were absent at capture time.
    pub removed: usize,
    /// Files already identical to the snapshot.
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Owns the rollback registry and the on-disk backup layout.
pub struct RollbackManager {
    config: RollbackConfig,
    store: RollbackStore,
}

impl RollbackManager {
    pub fn new(config: RollbackConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RollbackConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store: RollbackStore::new(clock),
        }
    }

    pub fn config(&self) -> &RollbackConfig {
        &self.config
    }

    fn backup_root(&self, repo: &Path) -> PathBuf {
        repo.join(&self.config.backup_dir_name)
    }

    fn manifest_path(&self, repo: &Path, id: &str) -> PathBuf {
        self.backup_root(repo).join(format!("{}.json", id))
    }

    // -----------------------------------------------------------------------
    // Capture
    // -----------------------------------------------------------------------

    /// Snapshot every file of the working tree.
    pub fn create_rollback_point(
        &self,
        repo: &Path,
        branch: &str,
    ) -> Result<RollbackPoint, RollbackError> {
        self.create_rollback_point_for(repo, branch, &[])
    }

    /// Snapshot the working tree and additionally record each of `targets`
    /// that does not exist yet, so rollback deletes it.
    #[instrument(skip(self, targets), fields(repo = %repo.display()))]
    pub fn create_rollback_point_for(
        &self,
        repo: &Path,
        branch: &str,
        targets: &[String],
    ) -> Result<RollbackPoint, RollbackError> {
        if !repo.is_dir() {
            return Err(RollbackError::RepositoryNotFound(repo.display().to_string()));
        }

        let created_at = self.store.now();
        let id = format!(
            "rp_{}_{}",
            created_at.format("%Y%m%dT%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let backup_dir = self.backup_root(repo).join(&id);
        fs::create_dir_all(&backup_dir)?;

        let (revision, dirty) = self.vcs_state(repo);

        let paths = walk_tree(repo, &self.config.backup_dir_name, &self.config.exclude)?;
        let mut files = Vec::with_capacity(paths.len() + targets.len());
        for rel in &paths {
            match capture_file(repo, rel, &backup_dir, self.config.inline_threshold_bytes) {
                Ok(state) => files.push(state),
                Err(e) => {
                    // Leave no half-written backup behind.
                    let _ = fs::remove_dir_all(&backup_dir);
                    return Err(e.into());
                }
            }
        }

        let captured: BTreeSet<&str> = paths.iter().map(String::as_str).collect();
        for target in targets {
            if !captured.contains(target.as_str()) && !repo.join(target).exists() {
                files.push(FileState::missing(target, created_at));
            }
        }

        let point = RollbackPoint {
            id,
            repo_path: repo.to_path_buf(),
            branch: branch.to_string(),
            revision,
            dirty,
            created_at,
            backup_dir,
            files,
        };

        self.persist_manifest(&point)?;
        self.store.insert(point.clone());

        info!(
            id = %point.id,
            files = point.files.len(),
            bytes = point.total_size(),
            revision = ?point.revision,
            dirty = point.dirty,
            "rollback point created"
        );
        Ok(point)
    }

    fn vcs_state(&self, repo: &Path) -> (Option<String>, bool) {
        let Ok(git) = GitClient::new(repo) else {
            debug!("not a git repository, snapshot is file-level only");
            return (None, false);
        };
        let revision = git.head_sha().unwrap_or_else(|e| {
            warn!(error = %e, "cannot read HEAD");
            None
        });
        let dirty = git.is_dirty(&self.config.backup_dir_name).unwrap_or_else(|e| {
            warn!(error = %e, "cannot read working tree status");
            true
        });
        (revision, dirty)
    }

    fn persist_manifest(&self, point: &RollbackPoint) -> Result<(), RollbackError> {
        let json = serde_json::to_vec_pretty(point)?;
        fsio::write_atomic(&self.manifest_path(&point.repo_path, &point.id), &json)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Restore
    // -----------------------------------------------------------------------

    /// Roll back by ID.
    pub fn rollback_by_id(&self, id: &str) -> Result<RollbackReport, RollbackError> {
        let point = self
            .store
            .get(id)
            .ok_or_else(|| RollbackError::NotFound(id.to_string()))?;
        self.rollback(&point)
    }

    /// Bring the working tree back to `point`.
    ///
    /// A hard reset is used when the snapshot was taken on a clean tree at
    /// a known revision; anything else, including a failed reset, restores
    /// file by file.
    #[instrument(skip(self, point), fields(id = %point.id))]
    pub fn rollback(&self, point: &RollbackPoint) -> Result<RollbackReport, RollbackError> {
        if !point.repo_path.is_dir() {
            return Err(RollbackError::RepositoryNotFound(point.repo_path.display().to_string()));
        }

        if self.config.prefer_vcs_reset && !point.dirty {
            if let Some(revision) = point.revision.as_deref() {
                match self.vcs_reset(point, revision) {
                    Ok(report) => return Ok(report),
                    Err(e) => warn!(error = %e, "vcs reset failed, restoring files"),
                }
            }
        }

        self.restore_files(point)
    }

    fn vcs_reset(
        &self,
        point: &RollbackPoint,
        revision: &str,
    ) -> Result<RollbackReport, RollbackError> {
        let git = GitClient::new(&point.repo_path)
            .map_err(|_| RollbackError::RevisionUnresolvable(revision.to_string()))?;
        git.hard_reset(revision)
            .map_err(|_| RollbackError::RevisionUnresolvable(revision.to_string()))?;
        let mut removed = git
            .clean_untracked(&self.config.backup_dir_name)
            .map_err(|e| RollbackError::Partial {
                restored: 0,
                failed: 1,
                errors: vec![e.to_string()],
            })?;

        // Ignored targets survive a clean.
        for state in point.files.iter().filter(|f| !f.exists) {
            let full = point.repo_path.join(&state.path);
            if fs::remove_file(&full).is_ok() {
                removed += 1;
                prune_empty_dirs(&point.repo_path, &full);
            }
        }

        // Ignored files are outside git's reach; verify them by digest.
        let drifted: Vec<&FileState> = point
            .files
            .iter()
            .filter(|f| f.exists && !matches_digest(&point.repo_path.join(&f.path), &f.hash))
            .collect();
        if !drifted.is_empty() {
            debug!(count = drifted.len(), "files differ after reset");
            return Err(RollbackError::Partial {
                restored: 0,
                failed: drifted.len(),
                errors: drifted
                    .iter()
                    .map(|f| format!("{}: differs after reset", f.path))
                    .collect(),
            });
        }

        let report = RollbackReport {
            point_id: point.id.clone(),
            method: RollbackMethod::VcsReset,
            restored: point.existing_file_count(),
            removed,
            skipped: 0,
            errors: Vec::new(),
        };
        info!(revision, removed, "rolled back via hard reset");
        Ok(report)
    }

    fn restore_files(&self, point: &RollbackPoint) -> Result<RollbackReport, RollbackError> {
        let repo = &point.repo_path;
        let mut report = RollbackReport {
            point_id: point.id.clone(),
            method: RollbackMethod::FileRestore,
            restored: 0,
            removed: 0,
            skipped: 0,
            errors: Vec::new(),
        };

        for state in &point.files {
            let full = repo.join(&state.path);
            if !state.exists {
                match fs::remove_file(&full) {
                    Ok(()) => {
                        report.removed += 1;
                        prune_empty_dirs(repo, &full);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => report.errors.push(format!("{}: {}", state.path, e)),
                }
                continue;
            }

            match restore_one(point, state, &full) {
                Ok(true) => report.restored += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => report.errors.push(format!("{}: {}", state.path, e)),
            }
        }

        // Files created since the snapshot.
        let known: BTreeSet<&str> = point.files.iter().map(|f| f.path.as_str()).collect();
        match walk_tree(repo, &self.config.backup_dir_name, &self.config.exclude) {
            Ok(current) => {
                for rel in current.iter().filter(|p| !known.contains(p.as_str())) {
                    let full = repo.join(rel);
                    match fs::remove_file(&full) {
                        Ok(()) => {
                            report.removed += 1;
                            prune_empty_dirs(repo, &full);
                        }
                        Err(e) => report.errors.push(format!("{}: {}", rel, e)),
                    }
                }
            }
            Err(e) => report.errors.push(format!("walk: {}", e)),
        }

        if !report.errors.is_empty() {
            warn!(
                restored = report.restored,
                failed = report.errors.len(),
                "rollback incomplete"
            );
            return Err(RollbackError::Partial {
                restored: report.restored,
                failed: report.errors.len(),
                errors: report.errors,
            });
        }

        info!(
            restored = report.restored,
            removed = report.removed,
            skipped = report.skipped,
            "rolled back via file restore"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    /// Check that `point` can still be restored.
    pub fn validate_rollback_point(&self, point: &RollbackPoint) -> Result<(), RollbackError> {
        if !point.repo_path.is_dir() {
            return Err(RollbackError::RepositoryNotFound(point.repo_path.display().to_string()));
        }
        if !point.backup_dir.is_dir() {
            return Err(RollbackError::BackupMissing(point.backup_dir.display().to_string()));
        }
        if let Some(revision) = point.revision.as_deref() {
            let resolvable = GitClient::new(&point.repo_path)
                .map(|git| git.revision_exists(revision))
                .unwrap_or(false);
            if !resolvable {
                return Err(RollbackError::RevisionUnresolvable(revision.to_string()));
            }
        }
        Ok(())
    }

    pub fn list_rollback_points(&self) -> Vec<RollbackPoint> {
        self.store.list()
    }

    pub fn get_rollback_point(&self, id: &str) -> Option<RollbackPoint> {
        self.store.get(id)
    }

    /// Remove the backup directory, the manifest and the registry entry.
    pub fn delete_rollback_point(&self, id: &str) -> Result<(), RollbackError> {
        let point = self
            .store
            .remove(id)
            .ok_or_else(|| RollbackError::NotFound(id.to_string()))?;

        remove_if_exists(fs::remove_dir_all(&point.backup_dir))?;
        remove_if_exists(fs::remove_file(self.manifest_path(&point.repo_path, &point.id)))?;
        info!(id, "rollback point deleted");
        Ok(())
    }

    /// Delete every point older than `max_age`. Returns how many went.
    pub fn cleanup_old_rollback_points(&self, max_age: Duration) -> usize {
        let Some(cutoff) = self.store.now().checked_sub_signed(max_age) else {
            return 0;
        };
        let mut removed = 0;
        for id in self.store.ids_older_than(cutoff) {
            match self.delete_rollback_point(&id) {
                Ok(()) => removed += 1,
                Err(e) => warn!(id = %id, error = %e, "failed to delete old rollback point"),
            }
        }
        info!(removed, "old rollback points cleaned up");
        removed
    }

    /// Register manifests left under `repo` by earlier processes. Returns
    /// how many were added.
    pub fn load_persisted(&self, repo: &Path) -> Result<usize, RollbackError> {
        let root = self.backup_root(repo);
        if !root.is_dir() {
            return Ok(0);
        }

        let mut loaded = 0;
        for entry in fs::read_dir(&root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let point: RollbackPoint = match fs::read(&path)
                .map_err(RollbackError::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(RollbackError::from))
            {
                Ok(point) => point,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable manifest");
                    continue;
                }
            };
            if self.store.insert_if_absent(point) {
                loaded += 1;
            }
        }
        debug!(loaded, "persisted rollback points loaded");
        Ok(loaded)
    }
}

/// Restore one file. `Ok(false)` when it already matched the snapshot.
fn restore_one(point: &RollbackPoint, state: &FileState, full: &Path) -> std::io::Result<bool> {
    let unchanged = matches_digest(full, &state.hash);

    if !unchanged {
        let bytes = match &state.content {
            Some(inline) => inline.clone(),
            None => fs::read(point.backup_dir.join(&state.path))?,
        };
        if let Ok(meta) = fs::metadata(full) {
            // A read-only target cannot be replaced in place on every
            // platform; make it writable first.
            let mode = fsio::mode_of(&meta);
            if mode != 0 && mode & 0o200 == 0 {
                fsio::set_mode(full, mode | 0o200)?;
            }
        }
        fsio::write_atomic(full, &bytes)?;
    }

    let file = fs::File::options().write(true).open(full).or_else(|_| {
        fsio::set_mode(full, state.mode | 0o200)?;
        fs::File::options().write(true).open(full)
    })?;
    file.set_modified(SystemTime::from(state.modified))?;
    drop(file);
    fsio::set_mode(full, state.mode)?;

    Ok(!unchanged)
}

fn matches_digest(path: &Path, expected: &str) -> bool {
    fs::read(path).map(|b| digest(&b) == expected).unwrap_or(false)
}

fn remove_if_exists(result: std::io::Result<()>) -> std::io::Result<()> {
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn prune_empty_dirs(root: &Path, file: &Path) {
    let mut dir = file.parent();
    while let Some(d) = dir {
        if d == root || fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}
