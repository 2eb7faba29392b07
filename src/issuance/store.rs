//! Filesystem persistence for issued credentials: store-directory
//! resolution, fixed-depth backup rotation and owner-only writes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

/// How many rotated generations of a credential file are kept.
pub const BACKUP_DEPTH: u32 = 3;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create credential directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to rotate {path}: {source}")]
    Rotate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Makes sure the store directory exists (intermediate directories
/// included) and returns it as an absolute path, so credential paths
/// handed to callers survive a working-directory change.
pub fn resolve_store_directory(directory: &Path) -> Result<PathBuf, StoreError> {
    fs::create_dir_all(directory).map_err(|source| StoreError::CreateDirectory {
        path: directory.to_path_buf(),
        source,
    })?;
    if directory.is_absolute() {
        return Ok(directory.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(directory))
        .map_err(|source| StoreError::CreateDirectory {
            path: directory.to_path_buf(),
            source,
        })
}

/// Writes credential material at `path`, rotating any previous file into
/// numbered backups first. The file is created fresh with owner-only
/// permissions; an existing non-file entry at `path` makes the write
/// fail.
pub fn store_credential(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    rotate_backups(path)?;
    write_secure_file(path, content)?;
    info!("[store] wrote {} ({} bytes)", path.display(), content.len());
    Ok(())
}

/// Shifts existing backups of `path` one generation deeper, keeping at
/// most [`BACKUP_DEPTH`] generations: `path` becomes `path.1`, `path.1`
/// becomes `path.2`, and so on; the oldest generation is deleted.
///
/// Only regular files are rotated. Renames already performed are not
/// rolled back when a later step fails.
pub fn rotate_backups(path: &Path) -> Result<(), StoreError> {
    if !path.is_file() {
        return Ok(());
    }
    let oldest = numbered(path, BACKUP_DEPTH);
    if oldest.is_file() {
        fs::remove_file(&oldest).map_err(|source| StoreError::Rotate {
            path: oldest.clone(),
            source,
        })?;
    }
    for generation in (1..BACKUP_DEPTH).rev() {
        let from = numbered(path, generation);
        if from.is_file() {
            let to = numbered(path, generation + 1);
            fs::rename(&from, &to).map_err(|source| StoreError::Rotate {
                path: from.clone(),
                source,
            })?;
        }
    }
    let first = numbered(path, 1);
    fs::rename(path, &first).map_err(|source| StoreError::Rotate {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("[store] rotated {} -> {}", path.display(), first.display());
    Ok(())
}

fn numbered(path: &Path, generation: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

fn write_secure_file(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    use std::io::Write;

    let map = |source: io::Error| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    #[cfg(unix)]
    let mut file = {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .map_err(map)?
    };
    #[cfg(not(unix))]
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(map)?;
    file.write_all(content).map_err(map)?;
    file.flush().map_err(map)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::random_secret_default;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gridcred-store-{}", random_secret_default()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn first_write_creates_the_file_without_backups() {
        let dir = scratch_dir();
        let target = dir.join("cred.pem");
        store_credential(&target, b"one").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"one");
        assert!(!numbered(&target, 1).exists());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rotation_keeps_at_most_three_generations() {
        let dir = scratch_dir();
        let target = dir.join("cred.pem");
        for round in 0..5 {
            store_credential(&target, format!("round-{round}").as_bytes()).unwrap();
        }
        assert_eq!(fs::read_to_string(&target).unwrap(), "round-4");
        assert_eq!(fs::read_to_string(numbered(&target, 1)).unwrap(), "round-3");
        assert_eq!(fs::read_to_string(numbered(&target, 2)).unwrap(), "round-2");
        assert_eq!(fs::read_to_string(numbered(&target, 3)).unwrap(), "round-1");
        assert!(!numbered(&target, 4).exists());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn directories_at_the_target_are_not_rotated() {
        let dir = scratch_dir();
        let target = dir.join("cred.pem");
        fs::create_dir(&target).unwrap();
        let err = store_credential(&target, b"x").unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));
        assert!(target.is_dir());
        fs::remove_dir_all(&dir).ok();
    }

    #[cfg(unix)]
    #[test]
    fn credentials_are_written_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = scratch_dir();
        let target = dir.join("cred.pem");
        store_credential(&target, b"secret").unwrap();
        let mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn resolve_creates_missing_directories_and_returns_absolute_paths() {
        let dir = scratch_dir().join("a").join("b");
        let resolved = resolve_store_directory(&dir).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.is_dir());
        fs::remove_dir_all(dir.parent().unwrap().parent().unwrap()).ok();
    }
}
