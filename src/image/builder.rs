//! Layered Image Builder (§4.6): synthesizes a build recipe that pre-warms
//! module caches from manifests read out of the source-control object
//! database, then streams `build` against that recipe with the object store
//! itself (not the working tree) as the build context.

use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::process;
use crate::scm::{manifest, ModuleManifest, RepoInfo};

use super::ImageError;

const MODULE_FETCH_CMD: &str = "go mod download";

/// Synthesizes the Dockerfile-shaped build recipe text for `base` plus the
/// given manifests, using `scm_binary` to extract blobs from the object
/// store staged at `/git-ref` inside the build context.
fn render_recipe(base: &str, scm_binary: &str, manifests: &[ModuleManifest]) -> String {
    let mut out = String::new();
    out.push_str(&format!("FROM {base}\n"));
    out.push_str("COPY . /git-ref\n");

    for m in manifests {
        let manifest_name = m
            .relative_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "go.mod".to_string());
        out.push_str("RUN mkdir -p /go-module\n");
        out.push_str(&format!(
            "RUN {scm_binary} --git-dir=/git-ref --work-tree=/go-module cat-file blob {} > /go-module/{manifest_name}\n",
            m.manifest_digest
        ));
        if let Some(lockfile_digest) = &m.lockfile_digest {
            out.push_str(&format!(
                "RUN {scm_binary} --git-dir=/git-ref --work-tree=/go-module cat-file blob {lockfile_digest} > /go-module/go.sum\n"
            ));
        }
        out.push_str(&format!(
            "RUN (grep -v '^replace' /go-module/{manifest_name} > /go-module/{manifest_name}.tmp && mv /go-module/{manifest_name}.tmp /go-module/{manifest_name}) && (cd /go-module && {MODULE_FETCH_CMD}) || true\n"
        ));
        out.push_str("RUN rm -rf /go-module\n");
    }

    out.push_str("WORKDIR /app\n");
    out.push_str("CMD [\"/bin/sketch\"]\n");
    out
}

/// Builds the derived image tagged `tag` from `base_image`, pre-warmed with
/// module caches extracted at HEAD. Module fetch failures are tolerated (the
/// derived image is a cache, not a correctness boundary); a missing author
/// identity is fatal.
pub async fn build(
    runtime: &str,
    scm_binary: &str,
    base_image: &str,
    tag: &str,
    checkout_path: &Path,
    repo: &RepoInfo,
    cancel: &CancellationToken,
) -> Result<(), ImageError> {
    let manifests = manifest::extract(scm_binary, checkout_path, cancel).await?;
    let recipe = render_recipe(base_image, scm_binary, &manifests);

    let build_dir = tempfile::tempdir()?;
    let recipe_path = build_dir.path().join("Dockerfile.sketch");
    std::fs::write(&recipe_path, &recipe)?;

    log::info!("building derived image {tag} from {base_image} ({} manifests)", manifests.len());

    let status = process::run_streaming(
        runtime,
        &[
            "build",
            "-f",
            &recipe_path.to_string_lossy(),
            "-t",
            tag,
            "--build-arg",
            &format!("AUTHOR_IDENTITY={}", repo.author_identity),
            &repo.common_dir.to_string_lossy(),
        ],
        cancel,
    )
    .await?;

    if !status.success() {
        return Err(ImageError::Build {
            tag: tag.to_string(),
            detail: format!("build exited with {status}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn recipe_includes_manifest_and_lockfile() {
        let manifests = vec![ModuleManifest {
            relative_path: PathBuf::from("go.mod"),
            manifest_digest: "aaaa".to_string(),
            lockfile_digest: Some("bbbb".to_string()),
        }];
        let recipe = render_recipe("docker.io/library/golang:1", "git", &manifests);
        assert!(recipe.starts_with("FROM docker.io/library/golang:1\n"));
        assert!(recipe.contains("cat-file blob aaaa"));
        assert!(recipe.contains("cat-file blob bbbb"));
        assert!(recipe.contains("|| true"));
        assert!(recipe.ends_with("CMD [\"/bin/sketch\"]\n"));
    }

    #[test]
    fn recipe_tolerates_missing_lockfile() {
        let manifests = vec![ModuleManifest {
            relative_path: PathBuf::from("nested/go.mod"),
            manifest_digest: "cccc".to_string(),
            lockfile_digest: None,
        }];
        let recipe = render_recipe("base", "git", &manifests);
        assert!(recipe.contains("cat-file blob cccc"));
        assert!(!recipe.contains("go.sum"));
    }
}
