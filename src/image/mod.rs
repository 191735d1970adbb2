//! Image Cache Manager and Layered Image Builder (§4.4, §4.6): probing,
//! pulling, and content-addressing the base image, and synthesizing a
//! derived image pre-warmed with module caches.

pub mod builder;
pub mod cache;

pub use cache::{CacheKey, ImageCacheManager};

/// Errors raised while inspecting, pulling, or building images.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    /// The container runtime subprocess failed.
    #[error(transparent)]
    Process(#[from] crate::process::ProcessError),

    /// `inspect` reported anything other than a clean "not found".
    #[error("failed to inspect {image_ref}: {detail}")]
    Inspect {
        /// Image reference that was inspected.
        image_ref: String,
        /// Subprocess output explaining the failure.
        detail: String,
    },

    /// The base image's content digest could not be parsed out of `inspect`'s output.
    #[error("could not determine content digest for {image_ref}")]
    MissingDigest {
        /// Image reference that was inspected.
        image_ref: String,
    },

    /// `pull` failed.
    #[error("failed to pull {image_ref}: {detail}")]
    Pull {
        /// Image reference that failed to pull.
        image_ref: String,
        /// Subprocess output explaining the failure.
        detail: String,
    },

    /// Author identity required for the build recipe is missing.
    #[error(transparent)]
    Scm(#[from] crate::scm::ScmError),

    /// `build` failed.
    #[error("failed to build derived image {tag}: {detail}")]
    Build {
        /// Tag of the image that failed to build.
        tag: String,
        /// Subprocess output explaining the failure.
        detail: String,
    },

    /// A temporary build context could not be prepared.
    #[error("failed to prepare build context: {0}")]
    Io(#[from] std::io::Error),
}
