//! Snapshot data: rollback points, per-file state, and capture helpers.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::fsio;

/// A recoverable checkpoint of a repository working tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPoint {
    pub id: String,
    pub repo_path: PathBuf,
    pub branch: String,
    /// HEAD at capture time, if the repository is a git repository.
    #[serde(default)]
    pub revision: Option<String>,
    /// The working tree had uncommitted changes at capture time.
    #[serde(default)]
    pub dirty: bool,
    pub created_at: DateTime<Utc>,
    /// `<repo>/<backup root>/<id>`, mirrors the tree.
    pub backup_dir: PathBuf,
    pub files: Vec<FileState>,
}

impl RollbackPoint {
    /// Number of captured files that existed at capture time.
    pub fn existing_file_count(&self) -> usize {
        self.files.iter().filter(|f| f.exists).count()
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// State of a single file at capture time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileState {
    /// Repository-relative, `/`-separated.
    pub path: String,
    /// `sha256:<hex>`; empty when the file did not exist.
    pub hash: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Permission bits (0 where the platform has none).
    pub mode: u32,
    /// Inline copy for small files.
    #[serde(default, with = "inline_bytes", skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,
    pub exists: bool,
}

impl FileState {
    /// Placeholder for a path that did not exist at capture time; rollback
    /// removes it.
    pub fn missing(path: &str, at: DateTime<Utc>) -> Self {
        Self {
            path: path.to_string(),
            hash: String::new(),
            size: 0,
            modified: at,
            mode: 0,
            content: None,
            exists: false,
        }
    }
}

/// `sha256:<hex>` digest of `bytes`.
pub fn digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Record `rel` under `repo` and copy it into `backup_dir`.
pub(crate) fn capture_file(
    repo: &Path,
    rel: &str,
    backup_dir: &Path,
    inline_threshold: u64,
) -> io::Result<FileState> {
    let full = repo.join(rel);
    let meta = fs::metadata(&full)?;
    let bytes = fs::read(&full)?;

    let dest = backup_dir.join(rel);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&dest, &bytes)?;

    let size = bytes.len() as u64;
    Ok(FileState {
        path: rel.to_string(),
        hash: digest(&bytes),
        size,
        modified: meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
        mode: fsio::mode_of(&meta),
        content: (size < inline_threshold).then_some(bytes),
        exists: true,
    })
}

/// Every regular file under `root`, as sorted `/`-separated relative paths.
///
/// `.git` directories are skipped at any depth, the backup root only at the
/// top. Paths matching an `exclude` glob are left out. Symlinks are not
/// followed.
pub(crate) fn walk_tree(
    root: &Path,
    backup_root: &str,
    exclude: &[String],
) -> io::Result<Vec<String>> {
    let mut files = Vec::new();
    walk_dir(root, root, backup_root, exclude, &mut files)?;
    files.sort();
    Ok(files)
}

fn walk_dir(
    root: &Path,
    dir: &Path,
    backup_root: &str,
    exclude: &[String],
    out: &mut Vec<String>,
) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        let name = entry.file_name();

        if name == ".git" {
            continue;
        }
        if dir == root && name.to_string_lossy() == backup_root {
            continue;
        }

        let Some(rel) = fsio::relative_slash(root, &path) else {
            continue;
        };
        if exclude.iter().any(|g| glob_match::glob_match(g, &rel)) {
            continue;
        }

        if file_type.is_dir() {
            walk_dir(root, &path, backup_root, exclude, out)?;
        } else if file_type.is_file() {
            out.push(rel);
        }
    }
    Ok(())
}

/// Serialize inline content as base64 so manifests stay valid JSON text.
mod inline_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}
