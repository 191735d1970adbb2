//! Image Cache Manager (§4.4): content-addressed cache keys over a base
//! image plus checkout path, and an in-process memo so a second
//! `find_or_build` call in the same run never re-invokes the builder.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::process;
use crate::scm::repo::RepoInfo;

use super::builder;
use super::ImageError;

/// Cache schema version folded into every key; bumping this invalidates all
/// previously cached derived images.
const CACHE_SCHEMA_VERSION: &str = "git-objects";

/// A 12-hex-character content-addressed cache key.
pub type CacheKey = String;

/// Computes the cache key over `base_digest || checkout_path || "git-objects"`,
/// truncated to 12 hex characters (§4.4, Invariant 1).
pub fn cache_key(base_digest: &str, checkout_path: &Path) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(base_digest.as_bytes());
    hasher.update(checkout_path.to_string_lossy().as_bytes());
    hasher.update(CACHE_SCHEMA_VERSION.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..12].to_string()
}

/// Derived image tag for a cache key.
pub fn derived_tag(key: &CacheKey) -> String {
    format!("sketch-{key}")
}

/// Probes, pulls, and content-addresses the base image; synthesizes or
/// reuses the derived per-checkout image.
#[derive(Debug)]
pub struct ImageCacheManager {
    runtime: String,
    found: Mutex<HashMap<CacheKey, String>>,
}

impl ImageCacheManager {
    /// Creates a manager that shells out to `runtime` (e.g. `"docker"`).
    pub fn new(runtime: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            runtime: runtime.into(),
            found: Mutex::new(HashMap::new()),
        })
    }

    /// Ensures `image_ref` is present locally, pulling it if absent. Reports
    /// to the user only when a pull actually happens.
    pub async fn ensure_base_image(
        &self,
        image_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ImageError> {
        if self.exists(image_ref, cancel).await? {
            return Ok(());
        }
        log::info!("pulling base image {image_ref}");
        let out = process::run_allow_failure(&self.runtime, &["pull", image_ref], cancel).await?;
        if !out.status.success() {
            return Err(ImageError::Pull {
                image_ref: image_ref.to_string(),
                detail: out.text(),
            });
        }
        Ok(())
    }

    /// `true` if `image_ref` resolves locally; `false` only for "no such
    /// image", any other inspect failure is an error.
    pub async fn exists(&self, image_ref: &str, cancel: &CancellationToken) -> Result<bool, ImageError> {
        let out = process::run_allow_failure(
            &self.runtime,
            &["inspect", "--format", "{{.Id}}", image_ref],
            cancel,
        )
        .await?;
        if out.status.success() {
            return Ok(true);
        }
        let text = out.text();
        if text.contains("No such object") || text.contains("no such image") || text.contains("No such image") {
            return Ok(false);
        }
        Err(ImageError::Inspect {
            image_ref: image_ref.to_string(),
            detail: text,
        })
    }

    /// Extracts the content digest of `image_ref` via `inspect`.
    pub async fn image_digest(&self, image_ref: &str, cancel: &CancellationToken) -> Result<String, ImageError> {
        let out = process::run(
            &self.runtime,
            &["inspect", "--format", "{{.Id}}", image_ref],
            cancel,
        )
        .await?;
        let digest = out.text().trim().to_string();
        if digest.is_empty() {
            return Err(ImageError::MissingDigest {
                image_ref: image_ref.to_string(),
            });
        }
        Ok(digest)
    }

    /// Ties `cache_key`, `exists`, and the Layered Image Builder together: a
    /// second call in this run with the same `(base_image, checkout_path)`
    /// returns the memoized tag without invoking the builder again (§8
    /// Round-trips and laws: "Cache").
    pub async fn find_or_build(
        &self,
        base_image: &str,
        checkout_path: &Path,
        repo: &RepoInfo,
        scm_binary: &str,
        force_rebuild: bool,
        cancel: &CancellationToken,
    ) -> Result<String, ImageError> {
        self.ensure_base_image(base_image, cancel).await?;
        let base_digest = self.image_digest(base_image, cancel).await?;
        let key = cache_key(&base_digest, checkout_path);

        {
            let found = self.found.lock().await;
            if let Some(tag) = found.get(&key) {
                return Ok(tag.clone());
            }
        }

        let tag = derived_tag(&key);
        let needs_build = force_rebuild || !self.exists(&tag, cancel).await?;
        if needs_build {
            builder::build(&self.runtime, scm_binary, base_image, &tag, checkout_path, repo, cancel).await?;
        }

        self.found.lock().await.insert(key, tag.clone());
        Ok(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_depends_on_both_inputs() {
        let a = cache_key("digestA", Path::new("/repo/one"));
        let b = cache_key("digestA", Path::new("/repo/two"));
        let c = cache_key("digestB", Path::new("/repo/one"));
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, cache_key("digestA", Path::new("/repo/one")));
    }

    #[test]
    fn derived_tag_is_prefixed() {
        assert_eq!(derived_tag(&"abc123def456".to_string()), "sketch-abc123def456");
    }
}
