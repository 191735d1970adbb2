//! The Safe-Write protocol (§4.8): every edit to an SSH identity, client
//! config, or known-hosts file goes through this module.
//!
//! Write to `<name>.<rand>.tmp` in the same directory, fsync, rename the
//! existing file to `<name>.bak` (if present), rename the temp file to
//! `<name>`, then chmod. A crash between any two steps leaves either the
//! prior file intact, or both the prior file (as `.bak`) and the new file
//! present — never a partially written file at the visible path.
//!
//! The temp file must live in the same directory as the target so the final
//! rename is atomic; this module refuses to write across filesystems rather
//! than silently fall back to a non-atomic copy (§9).

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Errors raised by the Safe-Write protocol.
#[derive(Debug, thiserror::Error)]
pub enum SafeWriteError {
    /// The target's parent directory does not exist or isn't a directory.
    #[error("{0} has no parent directory")]
    NoParent(PathBuf),

    /// Writing or fsyncing the temp file failed.
    #[error("failed writing temp file {path}: {source}")]
    WriteTemp {
        /// Path of the temp file.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Renaming the existing file aside to `.bak` failed.
    #[error("failed backing up {path}: {source}")]
    Backup {
        /// Path of the file being backed up.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Renaming the temp file into place failed.
    #[error("failed renaming {from} into {to}: {source}")]
    Rename {
        /// Temp file path.
        from: PathBuf,
        /// Target path.
        to: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Setting the final permission bits failed.
    #[error("failed chmod {path}: {source}")]
    Chmod {
        /// Target path.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

/// Writes `contents` to `path` using the Safe-Write protocol, setting the
/// final file's mode to `mode` (e.g. `0o600` for a private key, `0o644` for
/// public material).
pub fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), SafeWriteError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| SafeWriteError::NoParent(path.to_path_buf()))?;
    fs::create_dir_all(dir).map_err(|source| SafeWriteError::WriteTemp {
        path: dir.to_path_buf(),
        source,
    })?;

    let tmp_name = format!(
        "{}.{:x}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        rand_suffix(),
    );
    let tmp_path = dir.join(tmp_name);

    {
        let mut f = File::create(&tmp_path).map_err(|source| SafeWriteError::WriteTemp {
            path: tmp_path.clone(),
            source,
        })?;
        f.write_all(contents)
            .map_err(|source| SafeWriteError::WriteTemp {
                path: tmp_path.clone(),
                source,
            })?;
        f.sync_all().map_err(|source| SafeWriteError::WriteTemp {
            path: tmp_path.clone(),
            source,
        })?;
    }

    if path.exists() {
        let bak_path = bak_path_for(path);
        fs::rename(path, &bak_path).map_err(|source| SafeWriteError::Backup {
            path: path.to_path_buf(),
            source,
        })?;
    }

    fs::rename(&tmp_path, path).map_err(|source| SafeWriteError::Rename {
        from: tmp_path.clone(),
        to: path.to_path_buf(),
        source,
    })?;

    set_mode(path, mode)?;

    Ok(())
}

/// Path of the `.bak` file a given target is backed up to.
pub fn bak_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    path.with_file_name(name)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), SafeWriteError> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| {
        SafeWriteError::Chmod {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), SafeWriteError> {
    Ok(())
}

fn rand_suffix() -> u64 {
    use rand::RngCore;
    rand::thread_rng().next_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ssh_config");
        write_file(&path, b"first", 0o600).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");

        write_file(&path, b"second", 0o600).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert_eq!(fs::read(bak_path_for(&path)).unwrap(), b"first");
    }

    #[test]
    fn first_write_has_no_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("known_hosts");
        write_file(&path, b"data", 0o644).unwrap();
        assert!(!bak_path_for(&path).exists());
    }

    #[cfg(unix)]
    #[test]
    fn sets_requested_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("container_user_identity");
        write_file(&path, b"key material", 0o600).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
