//! Process Runner (§4.1): spawns external binaries with context cancellation,
//! captures combined stdio, and redacts secrets in logs.
//!
//! Generalizes the transport-over-subprocess pattern in the teacher's
//! `ssh.rs` (which shells out to spawn a `docker system dial-stdio` child and
//! wires its piped stdin/stdout into a hyper connector) into a
//! general-purpose runner with no hyper-specific plumbing.

use std::process::Stdio;
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::redact::redact_argv;

/// Errors raised while spawning or waiting on a subprocess.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The binary could not be spawned at all (not found, permission denied).
    #[error("failed to spawn `{name}`: {source}")]
    Spawn {
        /// Logical name of the binary (e.g. "docker", "git").
        name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The subprocess was spawned but I/O with it failed.
    #[error("I/O error running `{name}`: {source}")]
    Io {
        /// Logical name of the binary.
        name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The subprocess exited with a non-zero status.
    #[error("`{name}` exited with status {status}: {tail}")]
    NonZeroExit {
        /// Logical name of the binary.
        name: String,
        /// Process exit status, rendered for display.
        status: String,
        /// Tail of combined stdout+stderr, for diagnosis.
        tail: String,
    },

    /// The run was cancelled before the subprocess completed.
    #[error("`{name}` was cancelled")]
    Cancelled {
        /// Logical name of the binary.
        name: String,
    },
}

/// Output of a non-streaming run: combined stdout+stderr, in the order the
/// child emitted it (stdout and stderr are piped into a single stream so
/// ordering is best-effort but interleaving is preserved well enough for
/// error reporting).
#[derive(Debug, Clone)]
pub struct Output {
    /// Combined stdout+stderr bytes.
    pub bytes: Vec<u8>,
    /// Process exit status.
    pub status: std::process::ExitStatus,
}

impl Output {
    /// Lossily decodes the captured bytes as UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

const TAIL_BYTES: usize = 4096;

fn tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(TAIL_BYTES);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}

/// Runs `name` with `args`, capturing combined stdout+stderr. Does not
/// stream to the supervisor's own stdio. Returns `Ok` only on exit status 0;
/// on non-zero exit returns [`ProcessError::NonZeroExit`].
pub async fn run(
    name: &str,
    args: &[impl AsRef<str>],
    cancel: &CancellationToken,
) -> Result<Output, ProcessError> {
    let output = run_allow_failure(name, args, cancel).await?;
    if output.status.success() {
        Ok(output)
    } else {
        Err(ProcessError::NonZeroExit {
            name: name.to_string(),
            status: output.status.to_string(),
            tail: tail(&output.bytes),
        })
    }
}

/// Like [`run`] but returns `Ok` regardless of exit status; the caller
/// inspects `Output::status` itself. Used where non-zero exit is an expected,
/// handled outcome (e.g. `git rev-parse` probing for a repo root).
pub async fn run_allow_failure(
    name: &str,
    args: &[impl AsRef<str>],
    cancel: &CancellationToken,
) -> Result<Output, ProcessError> {
    let started = Instant::now();
    let redacted = redact_argv(args);

    let mut child = Command::new(name)
        .args(args.iter().map(|a| a.as_ref()))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            name: name.to_string(),
            source,
        })?;

    let mut stdout = child.stdout.take().expect("piped stdout");
    let mut stderr = child.stderr.take().expect("piped stderr");

    let read_stdout = async {
        let mut buf = Vec::new();
        stdout
            .read_to_end(&mut buf)
            .await
            .map(|_| buf)
            .map_err(|source| ProcessError::Io {
                name: name.to_string(),
                source,
            })
    };
    let read_stderr = async {
        let mut buf = Vec::new();
        stderr
            .read_to_end(&mut buf)
            .await
            .map(|_| buf)
            .map_err(|source| ProcessError::Io {
                name: name.to_string(),
                source,
            })
    };
    let wait = async {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                Err(ProcessError::Cancelled { name: name.to_string() })
            }
            status = child.wait() => {
                status.map_err(|source| ProcessError::Io { name: name.to_string(), source })
            }
        }
    };

    let (stdout_bytes, stderr_bytes, status) = tokio::try_join!(read_stdout, read_stderr, wait)?;

    let mut bytes = stdout_bytes;
    bytes.extend_from_slice(&stderr_bytes);

    let elapsed = started.elapsed();
    if status.success() {
        log::debug!("ran `{name} {}` in {elapsed:?}", redacted.join(" "));
    } else {
        log::error!(
            "`{name} {}` exited with {status} after {elapsed:?}: {}",
            redacted.join(" "),
            tail(&bytes)
        );
    }

    Ok(Output { bytes, status })
}

/// Runs `name` with `args`, attaching the child's stdio directly to the
/// supervisor's own stdio (used for `docker attach`/`docker build`, per
/// §4.1's streaming variant). Returns only the exit error, if any.
pub async fn run_streaming(
    name: &str,
    args: &[impl AsRef<str>],
    cancel: &CancellationToken,
) -> Result<std::process::ExitStatus, ProcessError> {
    let redacted = redact_argv(args);
    log::debug!("streaming `{name} {}`", redacted.join(" "));

    let mut child = Command::new(name)
        .args(args.iter().map(|a| a.as_ref()))
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            name: name.to_string(),
            source,
        })?;

    tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            Err(ProcessError::Cancelled { name: name.to_string() })
        }
        status = child.wait() => {
            status.map_err(|source| ProcessError::Io { name: name.to_string(), source })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout() {
        let cancel = CancellationToken::new();
        let out = run("echo", &["hello"], &cancel).await.unwrap();
        assert_eq!(out.text().trim(), "hello");
    }

    #[tokio::test]
    async fn run_reports_non_zero_exit() {
        let cancel = CancellationToken::new();
        let err = run("sh", &["-c", "exit 7"], &cancel).await.unwrap_err();
        match err {
            ProcessError::NonZeroExit { status, .. } => assert!(status.contains('7')),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_allow_failure_does_not_error_on_non_zero() {
        let cancel = CancellationToken::new();
        let out = run_allow_failure("sh", &["-c", "exit 3"], &cancel)
            .await
            .unwrap();
        assert_eq!(out.status.code(), Some(3));
    }

    #[tokio::test]
    async fn cancellation_kills_child() {
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        let handle = tokio::spawn(async move { run("sleep", &["30"], &cancel2).await });
        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ProcessError::Cancelled { .. })));
    }
}
