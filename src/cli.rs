//! CLI surface (§4.13): the flags a developer actually types. Parsing here
//! never touches source control or the filesystem beyond what `clap` itself
//! reads (argv, environment for `env` fallbacks); the result is handed to
//! [`crate::config::load`] to layer in the on-disk config file.

use std::path::PathBuf;

use clap::Parser;

/// Host-side container supervisor for an agentic coding session.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Cli {
    /// Local address the supervisor's own HTTP surfaces bind to
    #[arg(long)]
    pub addr: Option<String>,

    /// Model endpoint identifier forwarded into the container
    #[arg(long)]
    pub model: Option<String>,

    /// LLM API key
    ///
    /// Falls back to the `SKETCH_LLM_API_KEY` environment variable. Never
    /// printed in logs or `Debug` output.
    #[arg(long, env = "SKETCH_LLM_API_KEY", hide_env_values = true)]
    pub llm_api_key: Option<String>,

    /// Base image to derive the per-checkout image from
    #[arg(long)]
    pub base_image: Option<String>,

    /// Rebuild the derived image even if a cached one exists
    #[arg(long)]
    pub force_rebuild: bool,

    /// Leave the container running instead of tearing it down on exit
    #[arg(long)]
    pub no_cleanup: bool,

    /// Run a single agent turn non-interactively instead of attaching a TUI
    #[arg(long)]
    pub one_shot: bool,

    /// Suppress TTY allocation even in interactive mode
    #[arg(long)]
    pub no_termui: bool,

    /// Host-side SSH port; an ephemeral port is chosen if omitted
    #[arg(long)]
    pub ssh_port: Option<u16>,

    /// Extra container-runtime arguments, shell-quoted as one string
    #[arg(long)]
    pub extra_runtime_args: Option<String>,

    /// Open the session URL in a browser once the container is ready
    #[arg(long)]
    pub open: bool,

    /// Raise the log level to debug
    #[arg(short, long)]
    pub verbose: bool,

    /// Switch the logger's formatter to one JSON object per line
    #[arg(long)]
    pub log_json: bool,

    /// Path to a config file, overriding `~/.config/sketch/config.toml`
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Checkout path to operate on
    #[arg(default_value = ".")]
    pub checkout_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_to_current_directory() {
        let cli = Cli::parse_from(["sketch"]);
        assert_eq!(cli.checkout_path, PathBuf::from("."));
        assert!(!cli.verbose);
        assert!(cli.llm_api_key.is_none());
    }

    #[test]
    fn parses_flags() {
        let cli = Cli::parse_from([
            "sketch",
            "--addr",
            "0.0.0.0:8080",
            "--ssh-port",
            "2222",
            "--one-shot",
            "/repo",
        ]);
        assert_eq!(cli.addr.as_deref(), Some("0.0.0.0:8080"));
        assert_eq!(cli.ssh_port, Some(2222));
        assert!(cli.one_shot);
        assert_eq!(cli.checkout_path, PathBuf::from("/repo"));
    }
}
