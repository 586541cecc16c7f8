//! Small filesystem helpers shared by the applicator and rollback.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

/// Replace `path` with `data` through a temp file in the same directory.
/// Existing permission bits are kept; new files get 0644.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let existing_mode = fs::metadata(path).ok().map(|m| mode_of(&m));

    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut file = tmp.as_file();
        file.write_all(data)?;
        file.sync_all()?;
    }
    set_mode(tmp.path(), existing_mode.unwrap_or(0o644))?;

    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Unix permission bits, or 0 where there are none.
#[cfg(unix)]
pub fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub fn mode_of(_meta: &fs::Metadata) -> u32 {
    0
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0 {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Join a repository-relative path onto `root`, refusing absolute paths and
/// `..` components. `None` means the path would escape the root.
pub fn join_relative(root: &Path, rel: &str) -> Option<PathBuf> {
    let rel_path = Path::new(rel);
    if rel.is_empty() || rel_path.is_absolute() {
        return None;
    }
    let escapes = rel_path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return None;
    }
    Some(root.join(rel_path))
}

/// Canonical spelling of a repository-relative path: `.` components and
/// repeated or backward separators are dropped, so `./src//a.rs` and
/// `src/a.rs` compare equal.
pub fn normalize_relative(rel: &str) -> String {
    rel.split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Forward-slash form of a path relative to `root`.
pub fn relative_slash(root: &Path, full: &Path) -> Option<String> {
    let rel = full.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_relative() {
        assert_eq!(normalize_relative("./a.txt"), "a.txt");
        assert_eq!(normalize_relative("src//./lib.rs"), "src/lib.rs");
        assert_eq!(normalize_relative("src\\lib.rs"), "src/lib.rs");
        assert_eq!(normalize_relative("../x"), "../x");
    }

    #[test]
    fn test_write_atomic_creates_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.txt");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_atomic_keeps_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.sh");
        fs::write(&path, "#!/bin/sh\n").unwrap();
        set_mode(&path, 0o755).unwrap();
        write_atomic(&path, b"#!/bin/sh\necho hi\n").unwrap();
        assert_eq!(mode_of(&fs::metadata(&path).unwrap()), 0o755);
    }

    #[test]
    fn test_join_relative_rejects_escape() {
        let root = Path::new("/repo");
        assert_eq!(join_relative(root, "src/a.rs"), Some(PathBuf::from("/repo/src/a.rs")));
        assert!(join_relative(root, "../etc/passwd").is_none());
        assert!(join_relative(root, "/etc/passwd").is_none());
        assert!(join_relative(root, "").is_none());
    }
}
