use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use driftbox::error::AppError;
use driftbox::utils::{
    check_destination, display_rel_path, normalize_dest_path, sha256_hex, validate_filename,
    PathLocks,
};

#[test]
fn test_validate_filename() {
    assert_eq!(validate_filename("hello.txt").unwrap(), "hello.txt");
    assert_eq!(validate_filename("  spaced name.tar.gz ").unwrap(), "spaced name.tar.gz");
    // unicode and odd characters are fine, only separators are refused
    assert_eq!(validate_filename("résumé (final).pdf").unwrap(), "résumé (final).pdf");

    assert!(matches!(validate_filename(""), Err(AppError::InvalidRequest(_))));
    assert!(matches!(validate_filename("   "), Err(AppError::InvalidRequest(_))));
    assert!(matches!(validate_filename(".."), Err(AppError::InvalidRequest(_))));
    assert!(matches!(validate_filename("a/b.txt"), Err(AppError::InvalidRequest(_))));
    assert!(matches!(validate_filename("a\\b.txt"), Err(AppError::InvalidRequest(_))));
    assert!(matches!(validate_filename("nul\0byte"), Err(AppError::InvalidRequest(_))));
}

#[test]
fn test_normalize_dest_path() {
    assert_eq!(normalize_dest_path("").unwrap(), PathBuf::new());
    assert_eq!(normalize_dest_path("/").unwrap(), PathBuf::new());
    assert_eq!(normalize_dest_path("./docs//2024/").unwrap(), PathBuf::from("docs/2024"));
    assert_eq!(normalize_dest_path("docs\\reports").unwrap(), PathBuf::from("docs/reports"));

    assert!(matches!(
        normalize_dest_path("docs/../../etc"),
        Err(AppError::DestinationConflict(_))
    ));
    assert_eq!(display_rel_path(Path::new("docs/2024")), "docs/2024");
}

#[test]
fn test_check_destination() {
    let temp_dir = tempfile::tempdir().unwrap();
    let root = temp_dir.path();
    std::fs::create_dir_all(root.join("docs/taken")).unwrap();
    std::fs::write(root.join("plain.txt"), b"x").unwrap();

    let target = check_destination(root, Path::new("docs"), "new.bin").unwrap();
    assert_eq!(target, root.join("docs/new.bin"));

    // missing intermediate directories are fine, they get created later
    assert!(check_destination(root, Path::new("docs/a/b"), "x").is_ok());

    // a directory already sits at the target
    assert!(matches!(
        check_destination(root, Path::new("docs"), "taken"),
        Err(AppError::DestinationConflict(_))
    ));
    // a file sits where a directory is needed
    assert!(matches!(
        check_destination(root, Path::new("plain.txt/sub"), "x"),
        Err(AppError::DestinationConflict(_))
    ));
}

#[test]
fn test_sha256_hex() {
    let digest = sha256_hex(b"abc");
    assert_eq!(digest.len(), 64);
    assert_eq!(
        digest,
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
}

#[tokio::test]
async fn test_path_locks_serialize_same_path() {
    let locks = Arc::new(PathLocks::new());
    let path = PathBuf::from("/storage/a.bin");

    let guard = locks.lock(&path).await;
    let contender = {
        let locks = locks.clone();
        let path = path.clone();
        tokio::spawn(async move {
            let _guard = locks.lock(&path).await;
        })
    };

    // a different path is not blocked
    let _other = tokio::time::timeout(Duration::from_secs(1), locks.lock(Path::new("/storage/b.bin")))
        .await
        .expect("unrelated path should lock immediately");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!contender.is_finished());

    drop(guard);
    tokio::time::timeout(Duration::from_secs(1), contender)
        .await
        .expect("waiter should get the lock")
        .unwrap();

    drop(_other);
    assert!(locks.is_empty());
}

#[tokio::test]
async fn test_path_locks_forget_released_paths() {
    let locks = Arc::new(PathLocks::new());

    for i in 0..20 {
        let _guard = locks.lock(&PathBuf::from(format!("/storage/{}.bin", i))).await;
        assert_eq!(locks.len(), 1);
    }
    assert!(locks.is_empty());

    // an entry with a waiter survives its first holder
    let path = PathBuf::from("/storage/busy.bin");
    let guard = locks.lock(&path).await;
    let waiter = {
        let locks = locks.clone();
        let path = path.clone();
        tokio::spawn(async move {
            let _guard = locks.lock(&path).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(guard);
    assert_eq!(locks.len(), 1);

    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter should get the lock")
        .unwrap();
    assert!(locks.is_empty());
}
