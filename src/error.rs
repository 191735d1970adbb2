//! Crate-wide error type.
//!
//! Every subsystem defines its own focused error enum; this type stitches them
//! together the way [`crate::bridge`]'s hyper server composes with
//! [`crate::ssh`]'s certificate errors at the orchestrator boundary.

use crate::bridge::BridgeError;
use crate::container::ContainerError;
use crate::image::ImageError;
use crate::init::InitError;
use crate::process::ProcessError;
use crate::scm::ScmError;
use crate::seccomp::SeccompError;
use crate::ssh::SshError;
use crate::tunnel::TunnelError;

/// Top-level error returned from the orchestrator's public entry point and
/// from `main`.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// A precondition failed before any container was created (missing
    /// runtime, checkout not under source control, no author identity).
    #[error("{0}")]
    Preflight(String),

    /// Configuration could not be loaded or was internally inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A subprocess invocation failed in a way the caller could not recover
    /// from.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Source-control introspection (HEAD, branch, manifests) failed.
    #[error(transparent)]
    Scm(#[from] ScmError),

    /// Image probing, pulling, or building failed.
    #[error(transparent)]
    Image(#[from] ImageError),

    /// The source-control HTTP bridge failed to start or serve.
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// SSH identity, certificate, or client-config management failed.
    #[error(transparent)]
    Ssh(#[from] SshError),

    /// Container create/start/attach/cleanup failed.
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// The control-plane initializer could not reach the in-container agent.
    #[error(transparent)]
    Init(#[from] InitError),

    /// The port tunnel manager failed in a way that should abort the run.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    /// The seccomp profile cache could not be materialized.
    #[error(transparent)]
    Seccomp(#[from] SeccompError),

    /// Cleanup failed during teardown. Accumulated rather than fatal: this
    /// variant is only ever logged, never returned from a startup phase.
    #[error("cleanup error: {0}")]
    Cleanup(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SupervisorError>;
