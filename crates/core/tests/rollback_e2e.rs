//! End-to-end tests for snapshot capture and restoration.
//!
//! These tests use the real `RollbackManager` on temp directories, with a
//! `ManualClock` where ages matter.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{TimeZone, Utc};

use patchguard_core::clock::ManualClock;
use patchguard_core::config::RollbackConfig;
use patchguard_core::errors::RollbackError;
use patchguard_core::rollback::{digest, RollbackManager, RollbackMethod};

fn set_mtime(path: &Path, at: SystemTime) {
    fs::File::options().write(true).open(path).unwrap().set_modified(at).unwrap();
}

fn mtime(path: &Path) -> SystemTime {
    fs::metadata(path).unwrap().modified().unwrap()
}

fn small_inline_config() -> RollbackConfig {
    RollbackConfig {
        // "tiny" is inlined, "big.txt" goes through the backup copy.
        inline_threshold_bytes: 8,
        ..RollbackConfig::default()
    }
}

#[test]
fn test_snapshot_rollback_preserves_content_permissions_and_mtime() {
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path();
    fs::create_dir_all(repo.join("nested")).unwrap();
    fs::write(repo.join("tiny"), "abc").unwrap();
    fs::write(repo.join("nested/big.txt"), "a fairly long line of text\n").unwrap();

    let past = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
    set_mtime(&repo.join("tiny"), past);
    set_mtime(&repo.join("nested/big.txt"), past);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::Permissions::from_mode(0o750);
        fs::set_permissions(repo.join("nested/big.txt"), mode).unwrap();
    }

    let manager = RollbackManager::new(small_inline_config());
    let point = manager.create_rollback_point(repo, "main").unwrap();
    assert_eq!(point.files.len(), 2);
    let tiny = point.files.iter().find(|f| f.path == "tiny").unwrap();
    assert_eq!(tiny.hash, digest(b"abc"));
    assert!(tiny.content.is_some());
    assert!(point.backup_dir.join("nested/big.txt").is_file());

    fs::write(repo.join("tiny"), "changed").unwrap();
    fs::write(repo.join("nested/big.txt"), "clobbered").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::Permissions::from_mode(0o600);
        fs::set_permissions(repo.join("nested/big.txt"), mode).unwrap();
    }

    let report = manager.rollback(&point).unwrap();
    assert_eq!(report.method, RollbackMethod::FileRestore);
    assert_eq!(report.restored, 2);
    assert!(report.errors.is_empty());

    assert_eq!(fs::read_to_string(repo.join("tiny")).unwrap(), "abc");
    assert_eq!(
        fs::read_to_string(repo.join("nested/big.txt")).unwrap(),
        "a fairly long line of text\n"
    );
    assert_eq!(mtime(&repo.join("tiny")), past);
    assert_eq!(mtime(&repo.join("nested/big.txt")), past);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(repo.join("nested/big.txt")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }
}

#[test]
fn test_rollback_removes_files_created_after_capture() {
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path();
    fs::write(repo.join("keep.txt"), "keep").unwrap();

    let manager = RollbackManager::new(RollbackConfig::default());
    let point = manager
        .create_rollback_point_for(repo, "main", &["out/gen.rs".to_string()])
        .unwrap();
    assert!(point.files.iter().any(|f| f.path == "out/gen.rs" && !f.exists));

    fs::create_dir_all(repo.join("out")).unwrap();
    fs::write(repo.join("out/gen.rs"), "generated").unwrap();
    fs::write(repo.join("stray.txt"), "stray").unwrap();

    let report = manager.rollback_by_id(&point.id).unwrap();
    assert_eq!(report.removed, 2);
    assert_eq!(report.skipped, 1);
    assert!(!repo.join("out").exists());
    assert!(!repo.join("stray.txt").exists());
    assert_eq!(fs::read_to_string(repo.join("keep.txt")).unwrap(), "keep");
}

#[test]
fn test_manifest_survives_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path();
    fs::write(repo.join("a.txt"), "one").unwrap();

    let first = RollbackManager::new(small_inline_config());
    let point = first.create_rollback_point(repo, "release").unwrap();
    fs::write(repo.join("a.txt"), "two").unwrap();

    let second = RollbackManager::new(small_inline_config());
    assert!(matches!(
        second.rollback_by_id(&point.id),
        Err(RollbackError::NotFound(_))
    ));
    assert_eq!(second.load_persisted(repo).unwrap(), 1);
    assert_eq!(second.get_rollback_point(&point.id).unwrap().branch, "release");
    second.rollback_by_id(&point.id).unwrap();
    assert_eq!(fs::read_to_string(repo.join("a.txt")).unwrap(), "one");
}

#[test]
fn test_cleanup_removes_only_old_points() {
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path();
    fs::write(repo.join("a.txt"), "one").unwrap();

    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
    let manager = RollbackManager::with_clock(RollbackConfig::default(), clock.clone());
    let old = manager.create_rollback_point(repo, "main").unwrap();
    clock.advance(chrono::Duration::hours(30));
    let fresh = manager.create_rollback_point(repo, "main").unwrap();

    assert_eq!(manager.cleanup_old_rollback_points(chrono::Duration::hours(24)), 1);
    assert!(manager.get_rollback_point(&old.id).is_none());
    assert!(!old.backup_dir.exists());
    assert!(manager.get_rollback_point(&fresh.id).is_some());
    assert!(manager.validate_rollback_point(&fresh).is_ok());
    assert_eq!(manager.list_rollback_points().len(), 1);
}
