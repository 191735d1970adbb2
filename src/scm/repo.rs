//! Repository probing (§4.12 steps 2-3, 6): HEAD, branch, author identity,
//! upstream remote, and empty-commit bootstrap. Every operation here is a
//! thin wrapper over a single source-control subprocess invocation via
//! [`crate::process`].

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::process::{self, ProcessError};

use super::ScmError;

/// Resolved repository locations and identity, gathered once at startup.
#[derive(Debug, Clone)]
pub struct RepoInfo {
    /// Absolute path to the `.git` directory (or equivalent) for this checkout.
    pub git_dir: PathBuf,
    /// Absolute path to the working tree root.
    pub toplevel: PathBuf,
    /// Absolute path to the common directory (differs from `git_dir` in a worktree).
    pub common_dir: PathBuf,
    /// `user.name <user.email>`.
    pub author_identity: String,
    /// Upstream `origin` remote URL, if configured.
    pub upstream_url: Option<String>,
    /// Names forwarded from `sketch.envfwd`, verbatim.
    pub envfwd_names: Vec<String>,
}

async fn git(
    binary: &str,
    checkout_path: &Path,
    args: &[&str],
    cancel: &CancellationToken,
) -> Result<process::Output, ProcessError> {
    let dir = checkout_path.to_string_lossy().into_owned();
    let mut full: Vec<&str> = vec!["-C", &dir];
    full.extend_from_slice(args);
    process::run_allow_failure(binary, &full, cancel).await
}

fn trimmed(output: &process::Output) -> String {
    output.text().trim().to_string()
}

/// Probes the checkout at `checkout_path`, failing with
/// [`ScmError::NotARepo`] if it isn't inside a source-control working tree.
pub async fn probe(
    binary: &str,
    checkout_path: &Path,
    cancel: &CancellationToken,
) -> Result<RepoInfo, ScmError> {
    let git_dir_out = git(binary, checkout_path, &["rev-parse", "--git-dir"], cancel).await?;
    if !git_dir_out.status.success() {
        return Err(ScmError::NotARepo {
            path: checkout_path.to_path_buf(),
        });
    }
    let git_dir = checkout_path.join(trimmed(&git_dir_out));

    let toplevel = trimmed(&git(binary, checkout_path, &["rev-parse", "--show-toplevel"], cancel).await?);
    let common_dir = checkout_path.join(trimmed(
        &git(binary, checkout_path, &["rev-parse", "--git-common-dir"], cancel).await?,
    ));

    let author_identity = author_identity(binary, checkout_path, cancel).await?;
    let upstream_url = config_get(binary, checkout_path, "remote.origin.url", cancel).await;
    let envfwd_names = config_get_all(binary, checkout_path, "sketch.envfwd", cancel).await;

    Ok(RepoInfo {
        git_dir,
        toplevel: PathBuf::from(toplevel),
        common_dir,
        author_identity,
        upstream_url,
        envfwd_names,
    })
}

async fn author_identity(
    binary: &str,
    checkout_path: &Path,
    cancel: &CancellationToken,
) -> Result<String, ScmError> {
    let name = config_get(binary, checkout_path, "user.name", cancel).await;
    let email = config_get(binary, checkout_path, "user.email", cancel).await;
    match (name, email) {
        (Some(name), Some(email)) => Ok(format!("{name} <{email}>")),
        _ => Err(ScmError::NoAuthorIdentity),
    }
}

async fn config_get(
    binary: &str,
    checkout_path: &Path,
    key: &str,
    cancel: &CancellationToken,
) -> Option<String> {
    let out = git(binary, checkout_path, &["config", "--get", key], cancel)
        .await
        .ok()?;
    out.status.success().then(|| trimmed(&out)).filter(|s| !s.is_empty())
}

async fn config_get_all(
    binary: &str,
    checkout_path: &Path,
    key: &str,
    cancel: &CancellationToken,
) -> Vec<String> {
    let Ok(out) = git(binary, checkout_path, &["config", "--get-all", key], cancel).await else {
        return Vec::new();
    };
    if !out.status.success() {
        return Vec::new();
    }
    out.text().lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect()
}

/// Reads HEAD's commit hash; if the repository has no commits, creates an
/// empty initial commit first (§4.12 step 6, Boundary behavior "Empty checkout").
pub async fn ensure_head(
    binary: &str,
    checkout_path: &Path,
    cancel: &CancellationToken,
) -> Result<String, ScmError> {
    let count_out = git(binary, checkout_path, &["rev-list", "--all", "--count"], cancel).await?;
    let count: u64 = trimmed(&count_out).parse().unwrap_or(0);
    if count == 0 {
        let commit_out = git(
            binary,
            checkout_path,
            &["commit", "--allow-empty", "-m", "Initial empty commit"],
            cancel,
        )
        .await?;
        if !commit_out.status.success() {
            return Err(ScmError::Resolve {
                what: "empty initial commit".to_string(),
                detail: commit_out.text(),
            });
        }
    }

    let head_out = git(binary, checkout_path, &["rev-parse", "HEAD"], cancel).await?;
    if !head_out.status.success() {
        return Err(ScmError::Resolve {
            what: "HEAD".to_string(),
            detail: head_out.text(),
        });
    }
    Ok(trimmed(&head_out))
}

/// Current branch name, or `None` in detached-HEAD state.
pub async fn current_branch(
    binary: &str,
    checkout_path: &Path,
    cancel: &CancellationToken,
) -> Result<Option<String>, ScmError> {
    let out = git(binary, checkout_path, &["branch", "--show-current"], cancel).await?;
    let name = trimmed(&out);
    Ok((!name.is_empty()).then_some(name))
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
    async fn probe_rejects_non_repo() {
        if !has_git() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let err = probe("git", tmp.path(), &cancel).await.unwrap_err();
        assert!(matches!(err, ScmError::NotARepo { .. }));
    }

    #[tokio::test]
    async fn ensure_head_bootstraps_empty_repo() {
        if !has_git() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let init = process::run("git", &["-C", &tmp.path().to_string_lossy(), "init"], &cancel)
            .await
            .unwrap();
        assert!(init.status.success());
        process::run_allow_failure(
            "git",
            &["-C", &tmp.path().to_string_lossy(), "config", "user.email", "a@b.c"],
            &cancel,
        )
        .await
        .unwrap();
        process::run_allow_failure(
            "git",
            &["-C", &tmp.path().to_string_lossy(), "config", "user.name", "A"],
            &cancel,
        )
        .await
        .unwrap();

        let head = ensure_head("git", tmp.path(), &cancel).await.unwrap();
        assert_eq!(head.len(), 40);
    }
}
