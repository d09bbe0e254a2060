use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use vwsyncd::core::archive::{checksum, ArchiveService, NONCE_LEN, SALT_LEN};
use vwsyncd::error::SyncError;

fn build_time() -> chrono::DateTime<chrono::Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 45).unwrap()
}

fn write_file(root: &Path, relative: &str, contents: &[u8]) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

/// Relative path -> file contents for every regular file under `root`.
fn read_tree(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut tree = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let contents = fs::read(&path).unwrap();
                tree.insert(path.strip_prefix(root).unwrap().to_path_buf(), contents);
            }
        }
    }
    tree
}

#[test]
fn plain_archive_round_trips() {
    let source = TempDir::new().unwrap();
    write_file(source.path(), "a.txt", b"hello");
    write_file(source.path(), "attachments/note.bin", &[7u8; 4096]);
    write_file(source.path(), "icons/example.com.png", b"png bytes");

    let service = ArchiveService::new(source.path().to_path_buf(), 6, None);
    let archive = service.build(build_time()).unwrap();
    assert_eq!(archive.filename, "vaultwarden-backup-20240501-123045.zip");

    let dest = TempDir::new().unwrap();
    service.extract(&archive.bytes, dest.path()).unwrap();

    assert_eq!(read_tree(source.path()), read_tree(dest.path()));
}

#[test]
fn encrypted_archive_round_trips() {
    let source = TempDir::new().unwrap();
    write_file(source.path(), "a.txt", b"hello");
    let big: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    write_file(source.path(), "dir/b.bin", &big);

    let service = ArchiveService::new(
        source.path().to_path_buf(),
        6,
        Some("swordfish".to_string()),
    );
    let archive = service.build(build_time()).unwrap();
    assert_eq!(archive.filename, "vaultwarden-backup-20240501-123045.enc");

    let dest = TempDir::new().unwrap();
    service.extract(&archive.bytes, dest.path()).unwrap();
    assert_eq!(read_tree(source.path()), read_tree(dest.path()));
}

#[test]
fn wrong_password_fails_without_writing_files() {
    let source = TempDir::new().unwrap();
    write_file(source.path(), "a.txt", b"hello");

    let service = ArchiveService::new(
        source.path().to_path_buf(),
        6,
        Some("swordfish".to_string()),
    );
    let archive = service.build(build_time()).unwrap();

    let wrong = ArchiveService::new(source.path().to_path_buf(), 6, Some("wrong".to_string()));
    let dest = TempDir::new().unwrap();
    let result = wrong.extract(&archive.bytes, dest.path());

    assert!(matches!(result, Err(SyncError::Integrity(_))));
    assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
}

#[test]
fn two_encrypted_builds_differ_but_decrypt_identically() {
    let source = TempDir::new().unwrap();
    write_file(source.path(), "a.txt", b"hello");

    let service = ArchiveService::new(
        source.path().to_path_buf(),
        6,
        Some("swordfish".to_string()),
    );
    let first = service.build(build_time()).unwrap();
    let second = service.build(build_time()).unwrap();

    // Fresh salt and nonce every build.
    assert_ne!(
        first.bytes[..SALT_LEN + NONCE_LEN],
        second.bytes[..SALT_LEN + NONCE_LEN]
    );
    assert_ne!(
        first.bytes[SALT_LEN + NONCE_LEN..],
        second.bytes[SALT_LEN + NONCE_LEN..]
    );

    let dest_a = TempDir::new().unwrap();
    let dest_b = TempDir::new().unwrap();
    service.extract(&first.bytes, dest_a.path()).unwrap();
    service.extract(&second.bytes, dest_b.path()).unwrap();
    assert_eq!(read_tree(dest_a.path()), read_tree(dest_b.path()));
}

#[test]
fn empty_directory_builds_a_valid_empty_archive() {
    let source = TempDir::new().unwrap();
    let service = ArchiveService::new(source.path().to_path_buf(), 6, None);

    let archive = service.build(build_time()).unwrap();

    let dest = TempDir::new().unwrap();
    service.extract(&archive.bytes, dest.path()).unwrap();
    assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
}

#[test]
fn missing_data_path_is_a_distinct_error() {
    let service = ArchiveService::new(PathBuf::from("/nonexistent/vaultwarden/data"), 6, None);
    assert!(matches!(
        service.build(build_time()),
        Err(SyncError::DataPathMissing(_))
    ));
}

#[test]
fn traversal_entries_are_skipped_on_extract() {
    // Hand-craft an archive with a hostile entry name.
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("../evil.txt", options).unwrap();
        writer.write_all(b"escape").unwrap();
        writer.start_file("good.txt", options).unwrap();
        writer.write_all(b"fine").unwrap();
        writer.finish().unwrap();
    }
    let data = cursor.into_inner();

    let scratch = TempDir::new().unwrap();
    let dest = scratch.path().join("inner");
    fs::create_dir_all(&dest).unwrap();

    let service = ArchiveService::new(PathBuf::from("/unused"), 6, None);
    service.extract(&data, &dest).unwrap();

    assert_eq!(fs::read(dest.join("good.txt")).unwrap(), b"fine");
    assert!(!dest.join("evil.txt").exists());
    assert!(!scratch.path().join("evil.txt").exists());
}

#[test]
fn symlinks_are_not_archived() {
    let source = TempDir::new().unwrap();
    write_file(source.path(), "real.txt", b"data");
    #[cfg(unix)]
    std::os::unix::fs::symlink(source.path().join("real.txt"), source.path().join("link.txt"))
        .unwrap();

    let service = ArchiveService::new(source.path().to_path_buf(), 6, None);
    let archive = service.build(build_time()).unwrap();

    let dest = TempDir::new().unwrap();
    service.extract(&archive.bytes, dest.path()).unwrap();

    assert!(dest.path().join("real.txt").exists());
    assert!(!dest.path().join("link.txt").exists());
}

#[test]
fn identical_archives_share_a_checksum() {
    let source = TempDir::new().unwrap();
    write_file(source.path(), "a.txt", b"hello");

    let service = ArchiveService::new(source.path().to_path_buf(), 6, None);
    let first = service.build(build_time()).unwrap();
    let second = service.build(build_time()).unwrap();

    assert_eq!(checksum(&first.bytes), checksum(&second.bytes));
    assert_ne!(checksum(&first.bytes), checksum(b"something else"));
}
