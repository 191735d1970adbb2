//! Module Manifest Extractor (§4.5): enumerates `go.mod` files tracked in the
//! source-control index and resolves their blob digests (plus an optional
//! `go.sum` companion) at HEAD, entirely through the index/object database —
//! never the working tree, so the derived image is insensitive to
//! uncommitted edits.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::process;

use super::ScmError;

const MANIFEST_NAME: &str = "go.mod";
const LOCKFILE_NAME: &str = "go.sum";

/// One tracked module manifest and its companion lockfile, if present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleManifest {
    /// Path relative to the repository root.
    pub relative_path: PathBuf,
    /// Blob digest of `go.mod` at HEAD.
    pub manifest_digest: String,
    /// Blob digest of the companion `go.sum`, if tracked alongside it.
    pub lockfile_digest: Option<String>,
}

/// Lists every tracked `go.mod` and resolves its (and its `go.sum`'s) blob
/// digest at HEAD, in deterministic lexicographic order by relative path.
pub async fn extract(
    binary: &str,
    checkout_path: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<ModuleManifest>, ScmError> {
    let dir = checkout_path.to_string_lossy().into_owned();
    let ls_out = process::run(
        binary,
        &["-C", &dir, "ls-files", "-z", &format!("*{MANIFEST_NAME}")],
        cancel,
    )
    .await?;

    let mut paths: Vec<PathBuf> = ls_out
        .bytes
        .split(|&b| b == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| PathBuf::from(String::from_utf8_lossy(chunk).into_owned()))
        .collect();
    paths.sort();

    let mut manifests = Vec::with_capacity(paths.len());
    for path in paths {
        let manifest_digest = resolve_blob(binary, checkout_path, &path, cancel).await?;
        let lockfile_path = path.with_file_name(LOCKFILE_NAME);
        let lockfile_digest = resolve_blob(binary, checkout_path, &lockfile_path, cancel)
            .await
            .ok();
        manifests.push(ModuleManifest {
            relative_path: path,
            manifest_digest,
            lockfile_digest,
        });
    }
    Ok(manifests)
}

async fn resolve_blob(
    binary: &str,
    checkout_path: &Path,
    relative_path: &Path,
    cancel: &CancellationToken,
) -> Result<String, ScmError> {
    let dir = checkout_path.to_string_lossy().into_owned();
    let spec = format!("HEAD:{}", relative_path.display());
    let out = process::run_allow_failure(binary, &["-C", &dir, "rev-parse", &spec], cancel).await?;
    if !out.status.success() {
        return Err(ScmError::Resolve {
            what: spec,
            detail: out.text(),
        });
    }
    Ok(out.text().trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_git() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn extract_finds_go_mod_and_go_sum() {
        if !has_git() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let dir = tmp.path().to_string_lossy().into_owned();

        process::run("git", &["-C", &dir, "init"], &cancel).await.unwrap();
        process::run_allow_failure("git", &["-C", &dir, "config", "user.email", "a@b.c"], &cancel)
            .await
            .unwrap();
        process::run_allow_failure("git", &["-C", &dir, "config", "user.name", "A"], &cancel)
            .await
            .unwrap();

        std::fs::write(tmp.path().join("go.mod"), b"module example\n").unwrap();
        std::fs::write(tmp.path().join("go.sum"), b"").unwrap();
        process::run("git", &["-C", &dir, "add", "."], &cancel).await.unwrap();
        process::run("git", &["-C", &dir, "commit", "-m", "init"], &cancel)
            .await
            .unwrap();

        let manifests = extract("git", tmp.path(), &cancel).await.unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].relative_path, PathBuf::from("go.mod"));
        assert!(manifests[0].lockfile_digest.is_some());
    }

    #[tokio::test]
    async fn extract_tolerates_missing_lockfile() {
        if !has_git() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let dir = tmp.path().to_string_lossy().into_owned();

        process::run("git", &["-C", &dir, "init"], &cancel).await.unwrap();
        process::run_allow_failure("git", &["-C", &dir, "config", "user.email", "a@b.c"], &cancel)
            .await
            .unwrap();
        process::run_allow_failure("git", &["-C", &dir, "config", "user.name", "A"], &cancel)
            .await
            .unwrap();

        std::fs::write(tmp.path().join("go.mod"), b"module example\n").unwrap();
        process::run("git", &["-C", &dir, "add", "."], &cancel).await.unwrap();
        process::run("git", &["-C", &dir, "commit", "-m", "init"], &cancel)
            .await
            .unwrap();

        let manifests = extract("git", tmp.path(), &cancel).await.unwrap();
        assert_eq!(manifests.len(), 1);
        assert!(manifests[0].lockfile_digest.is_none());
    }
}
