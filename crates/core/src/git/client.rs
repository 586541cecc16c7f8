//! Local Git repository operations via `git2`.
//!
//! Only what snapshot and rollback need: the current revision, whether the
//! working tree is dirty, and a hard reset plus clean of untracked files.

use std::path::{Path, PathBuf};

use git2::{IndexAddOption, Oid, Repository, ResetType, Signature, Status, StatusOptions};
use tracing::{debug, info, instrument, warn};

use crate::errors::GitError;

/// High-level Git client wrapping a `git2::Repository`.
pub struct GitClient {
    repo: Repository,
    repo_path: PathBuf,
}

impl GitClient {
    /// Open an existing Git repository at `repo_path`.
    pub fn new<P: AsRef<Path>>(repo_path: P) -> Result<Self, GitError> {
        let path = repo_path.as_ref();
        debug!(path = %path.display(), "opening git repository");
        let repo = Repository::open(path)
            .map_err(|_| GitError::RepositoryNotFound(path.display().to_string()))?;
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    /// SHA of HEAD, or `None` on an unborn branch.
    pub fn head_sha(&self) -> Result<Option<String>, GitError> {
        let head = match self.repo.head() {
            Ok(head) => head,
            Err(e)
                if matches!(
                    e.code(),
                    git2::ErrorCode::UnbornBranch | git2::ErrorCode::NotFound
                ) =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        let commit = head.peel_to_commit()?;
        Ok(Some(commit.id().to_string()))
    }

    /// Whether the working tree differs from HEAD, ignoring anything under
    /// `skip` (a top-level directory name such as the backup root).
    pub fn is_dirty(&self, skip: &str) -> Result<bool, GitError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = self.repo.statuses(Some(&mut opts))?;
        let dirty = statuses.iter().any(|entry| {
            entry.status() != Status::CURRENT
                && !entry.path().map(|p| is_under(p, skip)).unwrap_or(false)
        });
        Ok(dirty)
    }

    /// Whether `sha` still names a commit in this repository.
    pub fn revision_exists(&self, sha: &str) -> bool {
        Oid::from_str(sha)
            .and_then(|oid| self.repo.find_commit(oid))
            .is_ok()
    }

    /// `git reset --hard <sha>`.
    #[instrument(skip(self))]
    pub fn hard_reset(&self, sha: &str) -> Result<(), GitError> {
        let oid = Oid::from_str(sha).map_err(|_| GitError::RefNotFound(sha.to_string()))?;
        let commit = self
            .repo
            .find_commit(oid)
            .map_err(|_| GitError::RefNotFound(sha.to_string()))?;
        self.repo.reset(commit.as_object(), ResetType::Hard, None)?;
        info!(sha, "hard reset complete");
        Ok(())
    }

    /// Delete untracked (non-ignored) files, leaving anything under `skip`
    /// alone. Returns the number of files removed.
    #[instrument(skip(self))]
    pub fn clean_untracked(&self, skip: &str) -> Result<usize, GitError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = self.repo.statuses(Some(&mut opts))?;

        let untracked: Vec<String> = statuses
            .iter()
            .filter(|e| e.status().contains(Status::WT_NEW))
            .filter_map(|e| e.path().map(str::to_string))
            .filter(|p| !is_under(p, skip))
            .collect();

        let mut removed = 0;
        for rel in &untracked {
            let full = self.repo_path.join(rel);
            match std::fs::remove_file(&full) {
                Ok(()) => {
                    removed += 1;
                    prune_empty_parents(&self.repo_path, &full);
                }
                Err(e) => {
                    warn!(path = %full.display(), error = %e, "failed to remove untracked file")
                }
            }
        }
        info!(removed, "cleaned untracked files");
        Ok(removed)
    }

    /// Stage everything and commit on HEAD.
    pub fn commit_all(&self, message: &str, name: &str, email: &str) -> Result<String, GitError> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_oid = index.write_tree()?;
        let tree = self.repo.find_tree(tree_oid)?;
        let sig = Signature::now(name, email)?;
        let parent = match self.repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let oid = self.repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        info!(sha = %oid, "created commit");
        Ok(oid.to_string())
    }
}

fn is_under(rel: &str, dir: &str) -> bool {
    !dir.is_empty() && (rel == dir || rel.starts_with(&format!("{}/", dir)))
}

fn prune_empty_parents(root: &Path, file: &Path) {
    let mut dir = file.parent();
    while let Some(d) = dir {
        if d == root || std::fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo() -> (tempfile::TempDir, GitClient) {
        let dir = tempfile::tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        let client = GitClient::new(dir.path()).unwrap();
        (dir, client)
    }

    #[test]
    fn test_unborn_head() {
        let (_dir, client) = init_repo();
        assert_eq!(client.head_sha().unwrap(), None);
    }

    #[test]
    fn test_dirty_and_reset() {
        let (dir, client) = init_repo();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        let sha = client.commit_all("init", "T", "t@t.com").unwrap();
        assert_eq!(client.head_sha().unwrap().as_deref(), Some(sha.as_str()));
        assert!(!client.is_dirty(".snapshot_backups").unwrap());

        std::fs::create_dir_all(dir.path().join(".snapshot_backups")).unwrap();
        std::fs::write(dir.path().join(".snapshot_backups/x.json"), "{}").unwrap();
        assert!(!client.is_dirty(".snapshot_backups").unwrap());

        std::fs::write(dir.path().join("a.txt"), "two").unwrap();
        std::fs::create_dir_all(dir.path().join("new/deep")).unwrap();
        std::fs::write(dir.path().join("new/deep/b.txt"), "b").unwrap();
        assert!(client.is_dirty(".snapshot_backups").unwrap());

        client.hard_reset(&sha).unwrap();
        assert_eq!(client.clean_untracked(".snapshot_backups").unwrap(), 1);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "one");
        assert!(!dir.path().join("new").exists());
        assert!(dir.path().join(".snapshot_backups/x.json").exists());
    }

    #[test]
    fn test_revision_exists() {
        let (dir, client) = init_repo();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        let sha = client.commit_all("init", "T", "t@t.com").unwrap();
        assert!(client.revision_exists(&sha));
        assert!(!client.revision_exists("0123456789abcdef0123456789abcdef01234567"));
        assert!(!client.revision_exists("not-a-sha"));
    }

    #[test]
    fn test_repo_not_found() {
        assert!(matches!(
            GitClient::new("/nonexistent"),
            Err(GitError::RepositoryNotFound(_))
        ));
    }
}
