//! `LaunchConfiguration` and `SupervisorConfig` (§3, §4.13): the fully
//! resolved knobs the CLI loader hands to the Orchestrator, three-tier
//! layered flag > `SKETCH_*` env var > `~/.config/sketch/config.toml` >
//! built-in default, mirroring how the teacher layers `DOCKER_HOST` under
//! explicit `connect_with_*` calls.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cli::Cli;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The on-disk config file exists but is not valid TOML.
    #[error("failed to parse {path}: {source}")]
    Toml {
        /// Path of the offending file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },

    /// The config file could not be read for a reason other than absence.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path of the file.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The user's cache or config directory could not be determined.
    #[error("could not determine a home/config directory for this platform")]
    NoHomeDir,
}

/// Logging verbosity, layered the same way as every other setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Errors and warnings.
    Warn,
    /// Default: errors, warnings, info.
    Info,
    /// `--verbose`: adds debug.
    Debug,
    /// Everything.
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Log line formatter, selected by `--log-json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single-line text (default).
    Text,
    /// One JSON object per line.
    Json,
}

/// On-disk `~/.config/sketch/config.toml` shape; every field optional so a
/// partial file only overrides what it names.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct FileConfig {
    addr: Option<String>,
    model: Option<String>,
    base_image: Option<String>,
    container_runtime: Option<String>,
    scm_binary: Option<String>,
    ssh_binary: Option<String>,
    ssh_keygen_binary: Option<String>,
    tunnel_ceiling: Option<usize>,
    init_retry_attempts: Option<u32>,
    log_level: Option<LogLevel>,
    log_format: Option<LogFormat>,
}

/// The fully-resolved set of knobs consumed by the Orchestrator, built by
/// layering CLI flags over environment variables over an optional TOML file
/// over built-in defaults (§4.13).
#[derive(Clone)]
pub struct SupervisorConfig {
    /// Host bind address for the supervisor's own listeners.
    pub addr: String,
    /// Model endpoint identifier, forwarded into the container.
    pub model: String,
    /// LLM API key; redacted in `Debug`.
    pub llm_api_key: Option<String>,
    /// Base image reference to derive the per-checkout image from.
    pub base_image: String,
    /// Container runtime binary name (e.g. `"docker"`).
    pub container_runtime: String,
    /// Source-control binary name (e.g. `"git"`).
    pub scm_binary: String,
    /// SSH client binary name.
    pub ssh_binary: String,
    /// `ssh-keygen` binary name (kept for parity; key material is generated
    /// in-process via `ssh-key`, never shelled out to).
    pub ssh_keygen_binary: String,
    /// Maximum simultaneous port tunnels.
    pub tunnel_ceiling: usize,
    /// Number of 100ms init-POST retry attempts before giving up (§4.10).
    pub init_retry_attempts: u32,
    /// Force a rebuild even if a cached derived image exists.
    pub force_rebuild: bool,
    /// Skip container teardown on exit.
    pub no_cleanup: bool,
    /// Run non-interactively (no attached TUI) for a single agent turn.
    pub one_shot: bool,
    /// Suppress TTY allocation even in interactive mode.
    pub no_termui: bool,
    /// Host-side SSH port, or `None` for an ephemeral port.
    pub ssh_port: Option<u16>,
    /// Raw, untokenized extra container-runtime arguments.
    pub extra_runtime_args: Option<String>,
    /// Open the UI URL in a browser once the container is ready.
    pub open: bool,
    /// Checkout path to operate on.
    pub checkout_path: PathBuf,
    /// Logging verbosity.
    pub log_level: LogLevel,
    /// Logging output format.
    pub log_format: LogFormat,
}

impl fmt::Debug for SupervisorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorConfig")
            .field("addr", &self.addr)
            .field("model", &self.model)
            .field("llm_api_key", &self.llm_api_key.as_ref().map(|_| "<redacted>"))
            .field("base_image", &self.base_image)
            .field("container_runtime", &self.container_runtime)
            .field("scm_binary", &self.scm_binary)
            .field("ssh_binary", &self.ssh_binary)
            .field("tunnel_ceiling", &self.tunnel_ceiling)
            .field("init_retry_attempts", &self.init_retry_attempts)
            .field("force_rebuild", &self.force_rebuild)
            .field("no_cleanup", &self.no_cleanup)
            .field("one_shot", &self.one_shot)
            .field("no_termui", &self.no_termui)
            .field("ssh_port", &self.ssh_port)
            .field("open", &self.open)
            .field("checkout_path", &self.checkout_path)
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .finish()
    }
}

fn default_config_path() -> Result<PathBuf, ConfigError> {
    directories::BaseDirs::new()
        .map(|d| d.config_dir().join("sketch").join("config.toml"))
        .ok_or(ConfigError::NoHomeDir)
}

fn load_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(text) => toml::from_str(&text).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
        Err(source) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Reads `SKETCH_*` environment variables relevant to configuration.
fn env_overrides() -> HashMap<&'static str, String> {
    let mut out = HashMap::new();
    for (key, env_name) in [
        ("addr", "SKETCH_ADDR"),
        ("model", "SKETCH_MODEL"),
        ("base_image", "SKETCH_BASE_IMAGE"),
        ("log", "SKETCH_LOG"),
    ] {
        if let Ok(value) = std::env::var(env_name) {
            out.insert(key, value);
        }
    }
    out
}

/// Builds the resolved `SupervisorConfig` from parsed CLI flags, layering
/// environment and file defaults underneath.
pub fn load(cli: &Cli) -> Result<SupervisorConfig, ConfigError> {
    let config_path = cli
        .config_file
        .clone()
        .map(Ok)
        .unwrap_or_else(default_config_path)?;
    let file = load_file_config(&config_path)?;
    let env = env_overrides();

    let addr = cli
        .addr
        .clone()
        .or_else(|| env.get("addr").cloned())
        .or(file.addr)
        .unwrap_or_else(|| "127.0.0.1:0".to_string());

    let model = cli
        .model
        .clone()
        .or_else(|| env.get("model").cloned())
        .or(file.model)
        .unwrap_or_else(|| "default".to_string());

    let llm_api_key = cli
        .llm_api_key
        .clone()
        .or_else(|| std::env::var("SKETCH_LLM_API_KEY").ok());

    let base_image = cli
        .base_image
        .clone()
        .or_else(|| env.get("base_image").cloned())
        .or(file.base_image)
        .unwrap_or_else(|| "docker.io/library/debian:bookworm-slim".to_string());

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        env.get("log")
            .and_then(|v| parse_log_level(v))
            .or(file.log_level)
            .unwrap_or(LogLevel::Info)
    };

    let log_format = if cli.log_json {
        LogFormat::Json
    } else {
        file.log_format.unwrap_or(LogFormat::Text)
    };

    Ok(SupervisorConfig {
        addr,
        model,
        llm_api_key,
        base_image,
        container_runtime: file.container_runtime.unwrap_or_else(|| "docker".to_string()),
        scm_binary: file.scm_binary.unwrap_or_else(|| "git".to_string()),
        ssh_binary: file.ssh_binary.unwrap_or_else(|| "ssh".to_string()),
        ssh_keygen_binary: file
            .ssh_keygen_binary
            .unwrap_or_else(|| "ssh-keygen".to_string()),
        tunnel_ceiling: file.tunnel_ceiling.unwrap_or(32),
        init_retry_attempts: file.init_retry_attempts.unwrap_or(100),
        force_rebuild: cli.force_rebuild,
        no_cleanup: cli.no_cleanup,
        one_shot: cli.one_shot,
        no_termui: cli.no_termui,
        ssh_port: cli.ssh_port,
        extra_runtime_args: cli.extra_runtime_args.clone(),
        open: cli.open,
        checkout_path: cli.checkout_path.clone(),
        log_level,
        log_format,
    })
}

fn parse_log_level(text: &str) -> Option<LogLevel> {
    match text.to_ascii_lowercase().as_str() {
        "error" => Some(LogLevel::Error),
        "warn" => Some(LogLevel::Warn),
        "info" => Some(LogLevel::Info),
        "debug" => Some(LogLevel::Debug),
        "trace" => Some(LogLevel::Trace),
        _ => None,
    }
}

/// Immutable launch configuration (§3), constructed once the orchestrator
/// has probed the checkout's source-control state.
#[derive(Clone)]
pub struct LaunchConfiguration {
    /// Random session identifier, e.g. a lowercase hex `uuid::Uuid::new_v4()`.
    pub session_id: String,
    /// Local bind address for the supervisor's HTTP surfaces.
    pub bind_addr: String,
    /// Model endpoint identifier.
    pub model: String,
    /// LLM API credentials; redacted in `Debug`.
    pub llm_api_key: Option<String>,
    /// Host filesystem path of the checkout.
    pub checkout_path: PathBuf,
    /// Author identity (`user.name <user.email>`) from source control.
    pub author_identity: String,
    /// Requested host-side SSH port, if any.
    pub ssh_port: Option<u16>,
    /// Feature toggles carried through from `SupervisorConfig`.
    pub one_shot: bool,
    /// See `SupervisorConfig::no_termui`.
    pub no_termui: bool,
    /// Original upstream source-control remote URL, if configured.
    pub upstream_url: Option<String>,
    /// HEAD commit hash at supervisor startup.
    pub head_commit: String,
    /// Current branch name, if not in detached-HEAD state.
    pub current_branch: Option<String>,
}

impl fmt::Debug for LaunchConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchConfiguration")
            .field("session_id", &self.session_id)
            .field("bind_addr", &self.bind_addr)
            .field("model", &self.model)
            .field("llm_api_key", &self.llm_api_key.as_ref().map(|_| "<redacted>"))
            .field("checkout_path", &self.checkout_path)
            .field("author_identity", &self.author_identity)
            .field("ssh_port", &self.ssh_port)
            .field("one_shot", &self.one_shot)
            .field("no_termui", &self.no_termui)
            .field("upstream_url", &self.upstream_url)
            .field("head_commit", &self.head_commit)
            .field("current_branch", &self.current_branch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_api_key() {
        let config = LaunchConfiguration {
            session_id: "abc123".into(),
            bind_addr: "127.0.0.1:8080".into(),
            model: "default".into(),
            llm_api_key: Some("sk-super-secret".into()),
            checkout_path: PathBuf::from("/tmp/repo"),
            author_identity: "Dev <dev@example.com>".into(),
            ssh_port: None,
            one_shot: false,
            no_termui: false,
            upstream_url: None,
            head_commit: "deadbeef".into(),
            current_branch: Some("main".into()),
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn file_config_parses_flat_table() {
        let text = r#"
            # a comment
            addr = "0.0.0.0:9000"
            tunnel-ceiling = 8
            log-format = "json"
        "#;
        let parsed: FileConfig = toml::from_str(text).unwrap();
        assert_eq!(parsed.addr.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(parsed.tunnel_ceiling, Some(8));
        assert!(matches!(parsed.log_format, Some(LogFormat::Json)));
    }
}
