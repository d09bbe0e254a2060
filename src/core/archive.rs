//! Backup archive construction, extraction and encryption.
//!
//! A backup is a ZIP of the vaultwarden data directory. When a password is
//! configured the ZIP is sealed with AES-256-GCM under a key derived with
//! PBKDF2-HMAC-SHA256; the wire layout is `salt(32) || nonce(12) || ciphertext`
//! so any copy of the archive is self-contained for decryption.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Result, SyncError};

pub const SALT_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const PBKDF2_ITERATIONS: u32 = 10_000;

/// One finished backup: the bytes are shared read-only across all fan-out
/// workers, so they live in a cheaply cloneable buffer.
#[derive(Debug, Clone)]
pub struct Archive {
    pub filename: String,
    pub bytes: Bytes,
}

#[derive(Clone)]
pub struct ArchiveService {
    data_path: PathBuf,
    compression_level: u32,
    password: Option<String>,
}

impl ArchiveService {
    pub fn new(data_path: PathBuf, compression_level: u32, password: Option<String>) -> Self {
        Self {
            data_path,
            compression_level,
            password,
        }
    }

    /// The archive name for a backup taken at `now` (UTC). Two syncs within
    /// the same wall-second share a name, which is what the existing-backup
    /// check keys on.
    pub fn filename_for(&self, now: DateTime<Utc>) -> String {
        let stamp = now.format("%Y%m%d-%H%M%S");
        let suffix = if self.password.is_some() { "enc" } else { "zip" };
        format!("vaultwarden-backup-{stamp}.{suffix}")
    }

    /// Build a backup of the data directory. Blocking: walks the filesystem
    /// and, with a password set, seals the whole buffer; run it on a
    /// blocking thread from async contexts.
    pub fn build(&self, now: DateTime<Utc>) -> Result<Archive> {
        if !self.data_path.exists() {
            return Err(SyncError::DataPathMissing(self.data_path.clone()));
        }

        let filename = self.filename_for(now);
        let zip_bytes = self.create_zip()?;

        let data = match &self.password {
            Some(password) => {
                let sealed = encrypt(&zip_bytes, password)?;
                debug!(filename = %filename, "archive encrypted");
                sealed
            }
            None => zip_bytes,
        };

        info!(filename = %filename, size_bytes = data.len(), "archive created");
        Ok(Archive {
            filename,
            bytes: Bytes::from(data),
        })
    }

    fn create_zip(&self) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = ZipWriter::new(&mut cursor);
            let options = SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(self.compression_level as i64));

            let mut files_added = 0usize;
            for entry in WalkDir::new(&self.data_path).sort_by_file_name() {
                let entry = entry.map_err(std::io::Error::from)?;
                // Regular files only: directories are implied by entry
                // names, symlinks and special files are not archived.
                if !entry.file_type().is_file() {
                    continue;
                }

                let relative = entry
                    .path()
                    .strip_prefix(&self.data_path)
                    .map_err(std::io::Error::other)?;
                let entry_name = relative.to_string_lossy().replace('\\', "/");

                let metadata = entry.metadata().map_err(std::io::Error::from)?;
                writer
                    .start_file(
                        entry_name.as_str(),
                        options.unix_permissions(entry_mode(&metadata)),
                    )
                    .map_err(|e| SyncError::Io(std::io::Error::other(e)))?;

                let mut file = fs::File::open(entry.path())?;
                std::io::copy(&mut file, &mut writer)?;
                files_added += 1;
            }

            writer
                .finish()
                .map_err(|e| SyncError::Io(std::io::Error::other(e)))?;
            debug!(files = files_added, "zip archive written");
        }
        Ok(cursor.into_inner())
    }

    /// Extract an archive into `dest`. When a password is configured and the
    /// input is long enough to carry the salt and nonce header, it is
    /// decrypted first; otherwise the input is treated as a plain ZIP.
    ///
    /// Entries whose name contains a parent-directory segment are skipped.
    /// Extraction is not atomic; callers are expected to extract into a
    /// scratch directory.
    pub fn extract(&self, data: &[u8], dest: &Path) -> Result<()> {
        let zip_data = match &self.password {
            Some(password) if data.len() >= SALT_LEN + NONCE_LEN => decrypt(data, password)?,
            _ => data.to_vec(),
        };

        let mut archive = ZipArchive::new(Cursor::new(zip_data))
            .map_err(|e| SyncError::Integrity(format!("invalid zip archive: {e}")))?;

        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|e| SyncError::Integrity(format!("zip entry {index}: {e}")))?;
            let name = entry.name().to_string();

            if has_traversal(&name) {
                warn!(entry = %name, "skipping archive entry with path traversal");
                continue;
            }

            let out_path = dest.join(&name);
            if entry.is_dir() {
                fs::create_dir_all(&out_path)?;
                continue;
            }

            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }

            let mut out = fs::File::create(&out_path)?;
            std::io::copy(&mut entry, &mut out)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = entry.unix_mode() {
                    fs::set_permissions(&out_path, fs::Permissions::from_mode(mode))?;
                }
            }
        }

        Ok(())
    }
}

/// SHA-256 hex digest; used to recognize identical archives.
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn entry_mode(metadata: &fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode()
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        0o644
    }
}

fn has_traversal(name: &str) -> bool {
    name.split(['/', '\\']).any(|segment| segment == "..")
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

fn encrypt(plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| SyncError::Integrity(format!("cipher init: {e}")))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| SyncError::Integrity("encryption failed".into()))?;

    let mut sealed = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&salt);
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

fn decrypt(data: &[u8], password: &str) -> Result<Vec<u8>> {
    if data.len() < SALT_LEN + NONCE_LEN {
        return Err(SyncError::Integrity("encrypted archive too short".into()));
    }

    let (salt, rest) = data.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_key(password, salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| SyncError::Integrity(format!("cipher init: {e}")))?;
    cipher.decrypt(Nonce::from_slice(nonce), ciphertext).map_err(|_| {
        SyncError::Integrity("authentication tag mismatch (wrong password or corrupt archive)".into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn filename_follows_the_timestamp_pattern() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 45).unwrap();

        let plain = ArchiveService::new(PathBuf::from("/tmp/data"), 6, None);
        assert_eq!(
            plain.filename_for(now),
            "vaultwarden-backup-20240501-123045.zip"
        );

        let encrypted =
            ArchiveService::new(PathBuf::from("/tmp/data"), 6, Some("swordfish".into()));
        assert_eq!(
            encrypted.filename_for(now),
            "vaultwarden-backup-20240501-123045.enc"
        );
    }

    #[test]
    fn traversal_segments_are_detected() {
        assert!(has_traversal("../evil.txt"));
        assert!(has_traversal("a/../../b.txt"));
        assert!(has_traversal("a\\..\\b.txt"));
        assert!(!has_traversal("a/b..c/d.txt"));
        assert!(!has_traversal("normal/path.txt"));
    }

    #[test]
    fn seal_and_open_round_trips() {
        let plaintext = b"zip bytes stand-in";
        let sealed = encrypt(plaintext, "swordfish").unwrap();

        assert_eq!(&decrypt(&sealed, "swordfish").unwrap(), plaintext);
    }

    #[test]
    fn wrong_password_is_an_integrity_error() {
        let sealed = encrypt(b"secret", "correct").unwrap();
        let result = decrypt(&sealed, "wrong");
        assert!(matches!(result, Err(SyncError::Integrity(_))));
    }

    #[test]
    fn sealed_output_carries_fresh_salt_and_nonce() {
        let first = encrypt(b"same plaintext", "pw").unwrap();
        let second = encrypt(b"same plaintext", "pw").unwrap();

        assert_ne!(first[..SALT_LEN + NONCE_LEN], second[..SALT_LEN + NONCE_LEN]);
        assert_ne!(first[SALT_LEN + NONCE_LEN..], second[SALT_LEN + NONCE_LEN..]);
        assert_eq!(
            decrypt(&first, "pw").unwrap(),
            decrypt(&second, "pw").unwrap()
        );
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        assert!(matches!(
            decrypt(&[0u8; 10], "pw"),
            Err(SyncError::Integrity(_))
        ));
    }

    #[test]
    fn checksum_is_stable_sha256_hex() {
        assert_eq!(
            checksum(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
