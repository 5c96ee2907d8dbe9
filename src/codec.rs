//! File encryption/decryption operations
//!
//! Turns a plaintext file into a container next to it (`notes.txt` ->
//! `notes.txt.enc`) and back. Every write goes through a temp file in the
//! destination directory which is flushed, fsync'ed, and renamed into place,
//! so an interrupted run leaves either the old state or the new one.

use crate::config::CodecSettings;
use crate::container;
use crate::error::{ErrorCategory, ErrorKind, Result, ShieldError};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Encrypt the file at `path` into `path` + suffix.
///
/// Fails with [`ErrorKind::AlreadyEncrypted`] if the file already starts with
/// the marker. The plaintext is deleted (when `settings.remove_plaintext` is
/// set) only after the container has been written and read back intact.
pub fn encrypt(path: &Path, passphrase: &[u8], settings: &CodecSettings) -> Result<PathBuf> {
    let plaintext = fs::read(path).map_err(|e| read_error(path, e))?;
    if container::has_marker(&plaintext, &settings.marker) {
        return Err(ShieldError::with_kind(
            ErrorCategory::User,
            ErrorKind::AlreadyEncrypted,
            format!("{} is already encrypted", path.display()),
        ));
    }

    let sealed = container::seal(&plaintext, passphrase, &settings.marker)
        .map_err(|e| e.with_context("encryption failed"))?;
    let output = container_path(path, &settings.suffix);
    write_atomic(&output, &sealed)
        .map_err(|e| e.with_context(format!("failed to write to {}", output.display())))?;
    verify_written(&output, &sealed)?;

    if settings.remove_plaintext {
        fs::remove_file(path).map_err(|e| {
            ShieldError::io(
                format!(
                    "{} was written but removing {} failed",
                    output.display(),
                    path.display()
                ),
                e,
            )
        })?;
    }

    debug!(input = %path.display(), output = %output.display(), "encrypted file");
    Ok(output)
}

/// Decrypt the container at `path` and return the plaintext.
///
/// A wrong passphrase is not detected and yields garbage of the original
/// length; callers should treat that as a usability problem, not an error.
pub fn decrypt(path: &Path, passphrase: &[u8], settings: &CodecSettings) -> Result<Vec<u8>> {
    let data = fs::read(path).map_err(|e| read_error(path, e))?;
    container::open(&data, passphrase, &settings.marker)
        .map_err(|e| e.with_context(format!("failed to decrypt {}", path.display())))
}

/// Decrypt the container at `path` into the path with the suffix stripped.
///
/// The container is removed afterwards unless `keep_container` is set. Since
/// a wrong passphrase cannot be detected, keeping it is the safer choice when
/// the passphrase is in doubt.
pub fn restore(
    path: &Path,
    passphrase: &[u8],
    settings: &CodecSettings,
    keep_container: bool,
) -> Result<PathBuf> {
    let output = plaintext_path(path, &settings.suffix).ok_or_else(|| {
        ShieldError::with_kind(
            ErrorCategory::User,
            ErrorKind::NotEncrypted,
            format!(
                "{} does not end in {}; not an encrypted file",
                path.display(),
                settings.suffix
            ),
        )
    })?;

    let plaintext = decrypt(path, passphrase, settings)?;
    write_atomic(&output, &plaintext)
        .map_err(|e| e.with_context(format!("failed to write to {}", output.display())))?;

    if !keep_container {
        fs::remove_file(path)
            .map_err(|e| ShieldError::io(format!("failed to remove {}", path.display()), e))?;
    }

    debug!(input = %path.display(), output = %output.display(), "restored file");
    Ok(output)
}

/// True if the file at `path` starts with the marker. Unreadable files are
/// reported as not encrypted.
pub fn is_encrypted(path: &Path, settings: &CodecSettings) -> bool {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let mut prefix = Vec::with_capacity(settings.marker.len());
    match file
        .take(settings.marker.len() as u64)
        .read_to_end(&mut prefix)
    {
        Ok(_) => container::has_marker(&prefix, &settings.marker),
        Err(_) => false,
    }
}

/// `notes.txt` -> `notes.txt.enc`
pub fn container_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// `notes.txt.enc` -> `notes.txt`; `None` if the name lacks the suffix or
/// would become empty.
pub fn plaintext_path(path: &Path, suffix: &str) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let stripped = name.strip_suffix(suffix)?;
    if stripped.is_empty() {
        return None;
    }
    Some(path.with_file_name(stripped))
}

/// Replace `path` with `contents` in one rename. The data is fsync'ed first,
/// and on Unix the result is readable by the owner only.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut staged = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| ShieldError::io(format!("cannot stage a write in {}", dir.display()), e))?;

    staged
        .write_all(contents)
        .and_then(|()| staged.flush())
        .and_then(|()| staged.as_file().sync_all())
        .map_err(|e| ShieldError::io("staged write did not reach disk", e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        staged
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|e| ShieldError::io("cannot restrict staged file permissions", e))?;
    }

    staged.persist(path).map_err(|e| {
        ShieldError::io(format!("cannot move staged file onto {}", path.display()), e.error)
    })?;
    Ok(())
}

/// Read `path` back and compare it with what was just written.
fn verify_written(path: &Path, expected: &[u8]) -> Result<()> {
    let actual = fs::read(path).map_err(|e| read_error(path, e))?;
    if actual != expected {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to remove corrupt container");
        }
        return Err(ShieldError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            format!(
                "{} does not match what was written; plaintext kept",
                path.display()
            ),
        ));
    }
    Ok(())
}

fn read_error(path: &Path, err: std::io::Error) -> ShieldError {
    ShieldError::io(format!("failed to read from {}", path.display()), err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

    const PASS: &[u8] = b"correct-horse";

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("plain.txt");
        let plaintext = b"Classification: TOP_SECRET\nHello";
        fs::write(&plain_path, plaintext).unwrap();

        let settings = CodecSettings::default();
        let crypt_path = encrypt(&plain_path, PASS, &settings).unwrap();

        assert_eq!(crypt_path, temp_dir.path().join("plain.txt.enc"));
        assert!(!plain_path.exists());
        let raw = fs::read(&crypt_path).unwrap();
        assert!(raw.starts_with(settings.marker.as_bytes()));

        assert_eq!(decrypt(&crypt_path, PASS, &settings).unwrap(), plaintext);

        let garbage = decrypt(&crypt_path, b"wrong-pass", &settings).unwrap();
        assert_eq!(garbage.len(), plaintext.len());
        assert_ne!(&garbage[..], &plaintext[..]);
    }

    #[test]
    fn test_keep_plaintext() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("plain.txt");
        fs::write(&plain_path, b"CONFIDENTIAL").unwrap();

        let settings = CodecSettings {
            remove_plaintext: false,
            ..CodecSettings::default()
        };
        let crypt_path = encrypt(&plain_path, PASS, &settings).unwrap();
        assert!(plain_path.exists());
        assert!(crypt_path.exists());
    }

    #[test]
    fn test_already_encrypted() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("plain.txt");
        fs::write(&plain_path, b"data").unwrap();

        let settings = CodecSettings::default();
        let crypt_path = encrypt(&plain_path, PASS, &settings).unwrap();
        let err = encrypt(&crypt_path, PASS, &settings).expect_err("double encryption");
        assert_eq!(err.kind, Some(ErrorKind::AlreadyEncrypted));
        assert!(!temp_dir.path().join("plain.txt.enc.enc").exists());
    }

    #[test]
    fn test_decrypt_plaintext_fails() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("plain.txt");
        fs::write(&plain_path, b"not a container").unwrap();

        let err = decrypt(&plain_path, PASS, &CodecSettings::default()).expect_err("no marker");
        assert_eq!(err.kind, Some(ErrorKind::NotEncrypted));
    }

    #[test]
    fn test_short_passphrase_leaves_plaintext() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("plain.txt");
        fs::write(&plain_path, b"data").unwrap();

        let err = encrypt(&plain_path, b"abc", &CodecSettings::default()).expect_err("too short");
        assert_eq!(err.kind, Some(ErrorKind::InvalidPassphraseLength));
        assert!(plain_path.exists());
        assert!(!temp_dir.path().join("plain.txt.enc").exists());
    }

    #[test]
    fn test_missing_input() {
        let temp_dir = TempDir::new().unwrap();
        let err = encrypt(
            &temp_dir.path().join("missing.txt"),
            PASS,
            &CodecSettings::default(),
        )
        .expect_err("missing file");
        assert_eq!(err.kind, Some(ErrorKind::Io));
        assert_eq!(err.category, ErrorCategory::User);
    }

    #[test]
    fn test_restore() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("report.md");
        fs::write(&plain_path, b"RESTRICTED numbers").unwrap();

        let settings = CodecSettings::default();
        let crypt_path = encrypt(&plain_path, PASS, &settings).unwrap();
        let restored = restore(&crypt_path, PASS, &settings, false).unwrap();

        assert_eq!(restored, plain_path);
        assert_eq!(fs::read(&plain_path).unwrap(), b"RESTRICTED numbers");
        assert!(!crypt_path.exists());
    }

    #[test]
    fn test_restore_keep_container() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("report.md");
        fs::write(&plain_path, b"RESTRICTED").unwrap();

        let settings = CodecSettings::default();
        let crypt_path = encrypt(&plain_path, PASS, &settings).unwrap();
        restore(&crypt_path, PASS, &settings, true).unwrap();
        assert!(crypt_path.exists());
        assert!(plain_path.exists());
    }

    #[test]
    fn test_restore_requires_suffix() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("report.md");
        fs::write(&path, b"whatever").unwrap();

        let err = restore(&path, PASS, &CodecSettings::default(), false).expect_err("no suffix");
        assert_eq!(err.kind, Some(ErrorKind::NotEncrypted));
        assert!(path.exists());
    }

    #[test]
    fn test_is_encrypted() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("plain.txt");
        fs::write(&plain_path, b"data").unwrap();

        let settings = CodecSettings {
            remove_plaintext: false,
            ..CodecSettings::default()
        };
        assert!(!is_encrypted(&plain_path, &settings));
        let crypt_path = encrypt(&plain_path, PASS, &settings).unwrap();
        assert!(is_encrypted(&crypt_path, &settings));
        assert!(!is_encrypted(&temp_dir.path().join("missing"), &settings));
    }

    #[test]
    fn test_empty_file() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("empty.txt");
        fs::write(&plain_path, b"").unwrap();

        let settings = CodecSettings::default();
        let crypt_path = encrypt(&plain_path, PASS, &settings).unwrap();
        assert_eq!(decrypt(&crypt_path, PASS, &settings).unwrap(), b"");
    }

    #[test]
    #[cfg(unix)]
    fn test_file_permissions() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("plain.txt");
        fs::write(&plain_path, b"test").unwrap();

        let crypt_path = encrypt(&plain_path, PASS, &CodecSettings::default()).unwrap();
        let permissions = fs::metadata(&crypt_path).unwrap().permissions();
        assert_eq!(permissions.mode() & 0o777, 0o600);
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(
            container_path(Path::new("a/b.txt"), ".enc"),
            PathBuf::from("a/b.txt.enc")
        );
        assert_eq!(
            plaintext_path(Path::new("a/b.txt.enc"), ".enc"),
            Some(PathBuf::from("a/b.txt"))
        );
        assert_eq!(plaintext_path(Path::new("a/.enc"), ".enc"), None);
        assert_eq!(plaintext_path(Path::new("a/b.txt"), ".enc"), None);
    }
}
