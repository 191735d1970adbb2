//! Seccomp Profile Cache (§4.3): materializes a fixed seccomp JSON profile in
//! the user cache directory, idempotently.

use std::path::{Path, PathBuf};

use crate::ssh::safe_write::{self, SafeWriteError};

/// Errors raised while materializing the seccomp profile.
#[derive(Debug, thiserror::Error)]
pub enum SeccompError {
    /// The user cache directory could not be determined or created.
    #[error("could not resolve or create cache directory: {0}")]
    CacheDir(std::io::Error),

    /// The profile file could not be read or written.
    #[error(transparent)]
    Write(#[from] SafeWriteError),

    /// The existing file could not be read to compare contents.
    #[error("could not read existing seccomp profile: {0}")]
    Read(std::io::Error),
}

const PROFILE_NAME: &str = "seccomp-no-kill-1.json";

/// The seccomp profile denying `kill`/`tkill`/`tgkill`/`pidfd_send_signal`
/// against pid 1 (the container's init process), allowing everything else.
fn profile_json() -> &'static str {
    r#"{
  "defaultAction": "SCMP_ACT_ALLOW",
  "syscalls": [
    {
      "names": ["kill", "tkill", "tgkill", "pidfd_send_signal"],
      "action": "SCMP_ACT_ERRNO",
      "args": [
        {
          "index": 0,
          "value": 1,
          "op": "SCMP_CMP_EQ"
        }
      ]
    }
  ]
}
"#
}

/// Ensures the seccomp profile exists at `<cache_dir>/sketch/seccomp-no-kill-1.json`
/// and returns its path. Safe to call concurrently from multiple supervisor
/// processes: if the file already holds the expected content, nothing is
/// written; otherwise it is (re)written via the Safe-Write protocol.
pub fn ensure_profile(cache_dir: &Path) -> Result<PathBuf, SeccompError> {
    let dir = cache_dir.join("sketch");
    std::fs::create_dir_all(&dir).map_err(SeccompError::CacheDir)?;
    let path = dir.join(PROFILE_NAME);

    let expected = profile_json();
    match std::fs::read_to_string(&path) {
        Ok(existing) if existing == expected => Ok(path),
        Ok(_) | Err(_) => {
            safe_write::write_file(&path, expected.as_bytes(), 0o644)?;
            Ok(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materializes_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = ensure_profile(tmp.path()).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();

        // Second call should be a no-op content-wise.
        let path2 = ensure_profile(tmp.path()).unwrap();
        let second = std::fs::read_to_string(&path2).unwrap();

        assert_eq!(path, path2);
        assert_eq!(first, second);
        assert!(first.contains("pidfd_send_signal"));
    }

    #[test]
    fn rewrites_if_corrupted() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sketch");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(PROFILE_NAME), b"not json").unwrap();

        let path = ensure_profile(tmp.path()).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, profile_json());
    }
}
