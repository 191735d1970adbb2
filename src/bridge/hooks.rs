//! Pre-/post-receive hook materialization (§4.7 Hooks): only written when
//! upstream forwarding is enabled, into the auxiliary hooks directory the
//! CGI handler points `GIT_HTTP_BACKEND_HOOKS_DIR` at.

use std::path::Path;

use crate::ssh::safe_write::{self, SafeWriteError};

const SENTINEL_USER_AGENT: &str = "sketch-intentional-push";

fn pre_receive_script() -> String {
    format!(
        r#"#!/bin/sh
set -e
while read oldrev newrev refname; do
  case "$refname" in
    refs/remotes/origin/*)
      branch=${{refname#refs/remotes/origin/}}
      if [ "$oldrev" != "0000000000000000000000000000000000000000" ]; then
        if ! git merge-base --is-ancestor "$oldrev" "$newrev"; then
          echo "rejecting non-fast-forward push to $refname" >&2
          exit 1
        fi
      fi
      if [ "$HTTP_USER_AGENT" != "{SENTINEL_USER_AGENT}" ]; then
        echo "rejecting unauthorized push to $refname" >&2
        exit 1
      fi
      upstream_url=$(git config --get remote.origin.url)
      timeout 10 git push "$upstream_url" "$newrev:refs/heads/$branch"
      ;;
  esac
done
"#
    )
}

fn post_receive_script() -> String {
    r#"#!/bin/sh
while read oldrev newrev refname; do
  case "$refname" in
    refs/heads/sketch/*)
      branch=${refname#refs/heads/sketch/}
      git branch --set-upstream-to="origin/$branch" "${refname#refs/heads/}" 2>/dev/null || true
      ;;
  esac
done
"#
    .to_string()
}

/// Writes `pre-receive` and `post-receive` into `hooks_dir`, mode 0755, via
/// the Safe-Write protocol.
pub fn materialize(hooks_dir: &Path) -> Result<(), SafeWriteError> {
    safe_write::write_file(&hooks_dir.join("pre-receive"), pre_receive_script().as_bytes(), 0o755)?;
    safe_write::write_file(
        &hooks_dir.join("post-receive"),
        post_receive_script().as_bytes(),
        0o755,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialize_writes_both_hooks_executable() {
        let tmp = tempfile::tempdir().unwrap();
        materialize(tmp.path()).unwrap();

        let pre = tmp.path().join("pre-receive");
        let post = tmp.path().join("post-receive");
        assert!(pre.exists());
        assert!(post.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&pre).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o755);
        }

        let pre_text = std::fs::read_to_string(pre).unwrap();
        assert!(pre_text.contains(SENTINEL_USER_AGENT));
        assert!(pre_text.contains("timeout 10"));

        let post_text = std::fs::read_to_string(post).unwrap();
        assert!(post_text.contains("refs/heads/sketch/"));
    }
}
