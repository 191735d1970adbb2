//! Container Lifecycle (§4.9): create, start, attach to, and clean up the
//! session container; publish ports; inject environment; stream the
//! host-architecture in-container binary.
//!
//! Argv construction follows the teacher's `Options`-struct-with-`Default`
//! convention (seen throughout `docker.rs`/`exec.rs`/`network.rs`) adapted
//! from building JSON request bodies to building a CLI argv.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::config::LaunchConfiguration;
use crate::process::{self, ProcessError};
use crate::tokenizer;

const SECCOMP_PREFIX: &str = "seccomp=";
const HOST_GATEWAY_ALIAS: &str = "host.docker.internal:host-gateway";

/// Errors raised by the Container Lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// The underlying runtime subprocess failed.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// No binary matches the container runtime's reported server architecture.
    #[error("no host binary available for container architecture {arch}")]
    UnsupportedArchitecture {
        /// Architecture reported by `version --format {{.Server.Arch}}`.
        arch: String,
    },

    /// A published port could not be parsed out of `port`'s output.
    #[error("could not resolve published host port for container port {container_port}: {detail}")]
    PortResolution {
        /// The container-side port that was queried.
        container_port: u16,
        /// Raw output that failed to parse.
        detail: String,
    },

    /// The host binary's permission bits could not be set before `cp`.
    #[error("failed chmod {path}: {source}")]
    Chmod {
        /// Host-side binary path.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

/// Configurable knobs for container creation not already carried by
/// [`LaunchConfiguration`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Requested host port for container port 80, or `None` for ephemeral.
    pub host_port_80: Option<u16>,
    /// Requested host port for container port 22, or `None` for ephemeral.
    pub host_port_22: Option<u16>,
    /// Environment variable names forwarded from `sketch.envfwd`.
    pub envfwd_names: Vec<String>,
    /// Raw, untokenized extra runtime arguments string from the CLI/config.
    pub extra_runtime_args: Option<String>,
}

/// A created (and possibly started) session container.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    /// `"sketch-" + session_id`.
    pub name: String,
    /// Derived image tag the container was created from.
    pub image_tag: String,
    /// Resolved host port for container port 80.
    pub host_port_80: u16,
    /// Resolved host port for container port 22.
    pub host_port_22: u16,
}

fn publish_arg(container_port: u16, host_port: Option<u16>) -> String {
    match host_port {
        Some(p) => format!("{p}:{container_port}"),
        None => format!("0:{container_port}"),
    }
}

/// Builds the argv for the runtime's `create` subcommand, per §4.9: name,
/// interactivity, port publishes, the `host.docker.internal` alias, the
/// seccomp profile, forwarded environment, extra runtime arguments inserted
/// immediately after `create`, then the image reference and the in-container
/// program argv.
pub fn build_create_argv(
    name: &str,
    image_tag: &str,
    launch: &LaunchConfiguration,
    seccomp_profile: &Path,
    options: &CreateOptions,
    forwarded_env: &[(String, String)],
    in_container_argv: &[String],
) -> Vec<String> {
    let mut argv = vec!["create".to_string()];

    let extra_tokens: Vec<String> = options
        .extra_runtime_args
        .as_deref()
        .map(tokenizer::tokenize)
        .unwrap_or_default();
    for token in extra_tokens.iter().rev() {
        argv.insert(1, token.clone());
    }

    argv.push("--name".to_string());
    argv.push(name.to_string());
    argv.push("-i".to_string());
    if !(launch.one_shot && launch.no_termui) {
        argv.push("-t".to_string());
    }

    argv.push("-p".to_string());
    argv.push(publish_arg(80, options.host_port_80));
    argv.push("-p".to_string());
    argv.push(publish_arg(22, options.host_port_22));

    argv.push("--add-host".to_string());
    argv.push(HOST_GATEWAY_ALIAS.to_string());

    argv.push("--security-opt".to_string());
    argv.push(format!("{SECCOMP_PREFIX}{}", seccomp_profile.display()));

    for (key, value) in forwarded_env {
        argv.push("-e".to_string());
        argv.push(format!("{key}={value}"));
    }

    argv.push(image_tag.to_string());
    argv.extend(in_container_argv.iter().cloned());
    argv
}

/// Determines the container runtime's server-side architecture.
pub async fn server_architecture(runtime: &str, cancel: &CancellationToken) -> Result<String, ContainerError> {
    let out = process::run(runtime, &["version", "--format", "{{.Server.Arch}}"], cancel).await?;
    Ok(out.text().trim().to_string())
}

/// Resolves the host binary to stream into the container for `arch`, from a
/// directory of precompiled `sketch-<arch>` binaries shipped alongside this
/// supervisor.
pub fn select_host_binary(bin_dir: &Path, arch: &str) -> Result<PathBuf, ContainerError> {
    let candidate = bin_dir.join(format!("sketch-{arch}"));
    if candidate.exists() {
        Ok(candidate)
    } else {
        Err(ContainerError::UnsupportedArchitecture { arch: arch.to_string() })
    }
}

/// Creates the container (does not start it).
pub async fn create(
    runtime: &str,
    argv: &[String],
    cancel: &CancellationToken,
) -> Result<(), ContainerError> {
    process::run(runtime, argv, cancel).await?;
    Ok(())
}

/// Streams `host_binary` into the container at `/bin/sketch`, mode 0700.
///
/// Sets the mode on the host-side file before `cp` rather than `exec`-ing a
/// `chmod` afterward: `exec` requires a running container, and this runs
/// pre-start. `docker cp` preserves the source file's mode bits.
pub async fn stream_binary(
    runtime: &str,
    name: &str,
    host_binary: &Path,
    cancel: &CancellationToken,
) -> Result<(), ContainerError> {
    set_mode(host_binary, 0o700)?;
    let dest = format!("{name}:/bin/sketch");
    process::run(runtime, &["cp", &host_binary.to_string_lossy(), &dest], cancel).await?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), ContainerError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|source| {
        ContainerError::Chmod {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), ContainerError> {
    Ok(())
}

/// Starts a created container.
pub async fn start(runtime: &str, name: &str, cancel: &CancellationToken) -> Result<(), ContainerError> {
    process::run(runtime, &["start", name], cancel).await?;
    Ok(())
}

/// Attaches the supervisor's own stdio to the container's TTY, returning
/// once the attach process exits or `cancel` fires.
pub async fn attach(
    runtime: &str,
    name: &str,
    cancel: &CancellationToken,
) -> Result<std::process::ExitStatus, ProcessError> {
    process::run_streaming(runtime, &["attach", name], cancel).await
}

/// Resolves the host-side port published for `container_port` via `port`.
pub async fn resolve_host_port(
    runtime: &str,
    name: &str,
    container_port: u16,
    cancel: &CancellationToken,
) -> Result<u16, ContainerError> {
    let out = process::run(runtime, &["port", name, &container_port.to_string()], cancel).await?;
    let text = out.text();
    let line = text.lines().next().unwrap_or("");
    let port_str = line.rsplit(':').next().unwrap_or("");
    port_str.trim().parse().map_err(|_| ContainerError::PortResolution {
        container_port,
        detail: text,
    })
}

/// Kills and removes the container unless `no_cleanup` is set. Failures are
/// logged, not propagated (§7 Shutdown policy: accumulate, keep tearing down).
pub async fn cleanup(runtime: &str, name: &str, no_cleanup: bool, cancel: &CancellationToken) {
    if no_cleanup {
        log::info!("leaving container {name} running (--no-cleanup)");
        return;
    }
    if let Err(e) = process::run_allow_failure(runtime, &["kill", name], cancel).await {
        log::warn!("failed to kill container {name}: {e}");
    }
    if let Err(e) = process::run_allow_failure(runtime, &["rm", name], cancel).await {
        log::warn!("failed to remove container {name}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn launch() -> LaunchConfiguration {
        LaunchConfiguration {
            session_id: "abc123".into(),
            bind_addr: "127.0.0.1:8080".into(),
            model: "default".into(),
            llm_api_key: None,
            checkout_path: PathBuf::from("/tmp/repo"),
            author_identity: "Dev <dev@example.com>".into(),
            ssh_port: None,
            one_shot: false,
            no_termui: false,
            upstream_url: None,
            head_commit: "deadbeef".into(),
            current_branch: Some("main".into()),
        }
    }

    #[test]
    fn extra_args_preserve_order() {
        let launch = launch();
        let options = CreateOptions {
            extra_runtime_args: Some("--memory 2g --cpus 2".to_string()),
            ..Default::default()
        };
        let argv = build_create_argv(
            "sketch-abc123",
            "sketch-deadbeef",
            &launch,
            Path::new("/cache/sketch/seccomp-no-kill-1.json"),
            &options,
            &[],
            &[],
        );
        assert_eq!(argv[0], "create");
        assert_eq!(&argv[1..5], &["--memory", "2g", "--cpus", "2"]);
    }

    #[test]
    fn publishes_80_and_22() {
        let launch = launch();
        let options = CreateOptions {
            host_port_80: Some(9000),
            ..Default::default()
        };
        let argv = build_create_argv(
            "sketch-abc123",
            "sketch-deadbeef",
            &launch,
            Path::new("/cache/sketch/seccomp-no-kill-1.json"),
            &options,
            &[],
            &[],
        );
        let joined = argv.join(" ");
        assert!(joined.contains("-p 9000:80"));
        assert!(joined.contains("-p 0:22"));
        assert!(joined.contains("host.docker.internal:host-gateway"));
    }

    #[test]
    fn one_shot_no_termui_skips_tty() {
        let mut launch = launch();
        launch.one_shot = true;
        launch.no_termui = true;
        let options = CreateOptions::default();
        let argv = build_create_argv(
            "sketch-abc123",
            "sketch-deadbeef",
            &launch,
            Path::new("/cache/sketch/seccomp-no-kill-1.json"),
            &options,
            &[],
            &[],
        );
        assert!(!argv.contains(&"-t".to_string()));
        assert!(argv.contains(&"-i".to_string()));
    }

    #[test]
    fn forwards_environment() {
        let launch = launch();
        let options = CreateOptions::default();
        let env = vec![("FOO".to_string(), "bar".to_string())];
        let argv = build_create_argv(
            "sketch-abc123",
            "sketch-deadbeef",
            &launch,
            Path::new("/cache/sketch/seccomp-no-kill-1.json"),
            &options,
            &env,
            &[],
        );
        assert!(argv.windows(2).any(|w| w[0] == "-e" && w[1] == "FOO=bar"));
    }

    #[cfg(unix)]
    #[test]
    fn set_mode_chmods_host_binary() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sketch-amd64");
        std::fs::write(&path, b"binary").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        set_mode(&path, 0o700).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }
}
