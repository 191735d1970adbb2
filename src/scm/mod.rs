//! Source-control probing and extraction (§4.5, §4.12 steps 2-3/6): reading
//! repository metadata and module manifests from the index/object database,
//! never from the working tree.

pub mod manifest;
pub mod repo;

pub use manifest::ModuleManifest;
pub use repo::RepoInfo;

/// Errors raised while shelling out to the source-control binary.
#[derive(Debug, thiserror::Error)]
pub enum ScmError {
    /// The checkout path is not inside a source-control working tree.
    #[error("{path} is not inside a source-control checkout")]
    NotARepo {
        /// The path that failed the probe.
        path: std::path::PathBuf,
    },

    /// No author identity is configured (`user.name`/`user.email`).
    #[error("no author identity configured: set user.name and user.email")]
    NoAuthorIdentity,

    /// The underlying subprocess failed.
    #[error(transparent)]
    Process(#[from] crate::process::ProcessError),

    /// A blob or ref could not be resolved.
    #[error("failed to resolve {what}: {detail}")]
    Resolve {
        /// What was being resolved (e.g. "HEAD", "go.mod blob digest").
        what: String,
        /// Subprocess output explaining the failure.
        detail: String,
    },
}
