//! `ClientConfigEdit` (§3, §4.8): structured, re-serializable view of the
//! sketch-owned SSH client configuration include file, plus the sketch-owned
//! known-hosts file.
//!
//! Both files are edited exclusively through [`crate::ssh::safe_write`]; this
//! module only computes the new textual content.

use std::path::Path;

use super::safe_write::{self, SafeWriteError};

/// A single `Host`/`Match` block, kept as opaque lines so round-tripping
/// never reformats content this module doesn't understand.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Block {
    header: String,
    body: Vec<String>,
}

/// Parsed view of the sketch-owned ssh client config file.
#[derive(Debug, Clone, Default)]
pub struct ClientConfigEdit {
    blocks: Vec<Block>,
}

fn is_block_header(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("Host ")
        || trimmed == "Host"
        || trimmed.starts_with("Match ")
}

impl ClientConfigEdit {
    /// Parses `text` into blocks. Any leading content before the first
    /// `Host`/`Match` line is discarded on reserialization (the sketch-owned
    /// file never carries global directives outside a block).
    pub fn parse(text: &str) -> Self {
        let mut blocks = Vec::new();
        let mut current: Option<Block> = None;
        for line in text.lines() {
            if is_block_header(line) {
                if let Some(block) = current.take() {
                    blocks.push(block);
                }
                current = Some(Block {
                    header: line.trim().to_string(),
                    body: Vec::new(),
                });
            } else if let Some(block) = current.as_mut() {
                block.body.push(line.to_string());
            }
        }
        if let Some(block) = current.take() {
            blocks.push(block);
        }
        ClientConfigEdit { blocks }
    }

    /// Loads and parses the file at `path`; treats a missing file as empty.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    fn session_header(session_id: &str) -> String {
        format!("Host sketch-{session_id}")
    }

    /// Adds (or replaces) the per-session host block binding hostname, port,
    /// identity file, certificate file and known-hosts file for
    /// `sketch-<session_id>`.
    pub fn set_session_host(
        &mut self,
        session_id: &str,
        hostname: &str,
        port: u16,
        identity_file: &Path,
        cert_file: &Path,
        known_hosts_file: &Path,
    ) {
        let header = Self::session_header(session_id);
        let body = vec![
            format!("    HostName {hostname}"),
            format!("    Port {port}"),
            format!("    IdentityFile {}", identity_file.display()),
            format!("    CertificateFile {}", cert_file.display()),
            format!("    UserKnownHostsFile {}", known_hosts_file.display()),
            "    User root".to_string(),
            "    StrictHostKeyChecking yes".to_string(),
        ];
        self.upsert(header, body);
    }

    /// Adds the generic `Host sketch-*` pattern block (shared known-hosts and
    /// identity-file directives) if one isn't already present.
    pub fn ensure_pattern_block(&mut self, identity_file: &Path, known_hosts_file: &Path) {
        let header = "Host sketch-*".to_string();
        if self.blocks.iter().any(|b| b.header == header) {
            return;
        }
        let body = vec![
            format!("    IdentityFile {}", identity_file.display()),
            format!("    UserKnownHostsFile {}", known_hosts_file.display()),
        ];
        self.blocks.push(Block { header, body });
    }

    fn upsert(&mut self, header: String, body: Vec<String>) {
        if let Some(existing) = self.blocks.iter_mut().find(|b| b.header == header) {
            existing.body = body;
        } else {
            self.blocks.push(Block { header, body });
        }
    }

    /// Removes only the per-session host block for `session_id`; all other
    /// blocks (including the shared `sketch-*` pattern block) are preserved.
    pub fn remove_session_host(&mut self, session_id: &str) {
        let header = Self::session_header(session_id);
        self.blocks.retain(|b| b.header != header);
    }

    /// True if a host block for `session_id` is present.
    pub fn has_session_host(&self, session_id: &str) -> bool {
        let header = Self::session_header(session_id);
        self.blocks.iter().any(|b| b.header == header)
    }

    /// Re-serializes the config back to text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            out.push_str(&block.header);
            out.push('\n');
            for line in &block.body {
                out.push_str(line);
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }

    /// Persists the current state to `path` via the Safe-Write protocol.
    pub fn save(&self, path: &Path) -> Result<(), SafeWriteError> {
        safe_write::write_file(path, self.render().as_bytes(), 0o644)
    }
}

/// Known-hosts editing (§4.8): a `@cert-authority` line scoped to loopback,
/// plus per-session legacy host-key lines.
pub mod known_hosts {
    use super::*;

    const CERT_AUTHORITY_PREFIX: &str = "@cert-authority localhost,127.0.0.1,[::1] ";

    /// Appends the loopback-scoped CA line if not already present, and the
    /// legacy host-key line for `host:port`, to `existing` text. Returns the
    /// new text; the caller persists it via [`safe_write::write_file`].
    pub fn add_entries(existing: &str, ca_public_key_line: &str, host_port: &str, host_key_line: &str) -> String {
        let mut lines: Vec<String> = existing.lines().map(str::to_string).collect();

        let ca_line = format!("{CERT_AUTHORITY_PREFIX}{ca_public_key_line}");
        if !lines.iter().any(|l| l == &ca_line) {
            lines.push(ca_line);
        }

        let host_line = format!("{host_port} {host_key_line}");
        if !lines.iter().any(|l| l == &host_line) {
            lines.push(host_line);
        }

        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    /// Removes only the legacy host-key line for `host_port`; `@cert-authority`
    /// lines scoped to loopback are always preserved (peer sessions may
    /// depend on them).
    pub fn remove_session_entry(existing: &str, host_port: &str) -> String {
        let mut out = String::new();
        for line in existing.lines() {
            if line.starts_with(CERT_AUTHORITY_PREFIX) {
                out.push_str(line);
                out.push('\n');
                continue;
            }
            if line.starts_with(&format!("{host_port} ")) {
                continue;
            }
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn id_file() -> PathBuf {
        PathBuf::from("/home/u/.config/sketch/container_user_identity")
    }
    fn cert_file() -> PathBuf {
        PathBuf::from("/home/u/.config/sketch/host_cert")
    }
    fn known_hosts_file() -> PathBuf {
        PathBuf::from("/home/u/.config/sketch/known_hosts")
    }

    #[test]
    fn add_and_remove_session_host_preserves_others() {
        let mut cfg = ClientConfigEdit::default();
        cfg.ensure_pattern_block(&id_file(), &known_hosts_file());
        cfg.set_session_host("aaa", "127.0.0.1", 2222, &id_file(), &cert_file(), &known_hosts_file());
        cfg.set_session_host("bbb", "127.0.0.1", 2223, &id_file(), &cert_file(), &known_hosts_file());

        assert!(cfg.has_session_host("aaa"));
        assert!(cfg.has_session_host("bbb"));

        cfg.remove_session_host("aaa");

        assert!(!cfg.has_session_host("aaa"));
        assert!(cfg.has_session_host("bbb"));
        assert!(cfg.blocks.iter().any(|b| b.header == "Host sketch-*"));
    }

    #[test]
    fn pattern_block_added_once() {
        let mut cfg = ClientConfigEdit::default();
        cfg.ensure_pattern_block(&id_file(), &known_hosts_file());
        cfg.ensure_pattern_block(&id_file(), &known_hosts_file());
        let count = cfg.blocks.iter().filter(|b| b.header == "Host sketch-*").count();
        assert_eq!(count, 1);
    }

    #[test]
    fn round_trip_through_render_and_parse() {
        let mut cfg = ClientConfigEdit::default();
        cfg.set_session_host("ccc", "127.0.0.1", 2224, &id_file(), &cert_file(), &known_hosts_file());
        let text = cfg.render();
        let reparsed = ClientConfigEdit::parse(&text);
        assert!(reparsed.has_session_host("ccc"));
    }

    #[test]
    fn known_hosts_cleanup_preserves_cert_authority() {
        let existing = "@cert-authority localhost,127.0.0.1,[::1] ssh-ed25519 AAAA...\n\
                         [127.0.0.1]:2222 ssh-ed25519 BBBB...\n\
                         [127.0.0.1]:2223 ssh-ed25519 CCCC...\n";
        let cleaned = known_hosts::remove_session_entry(existing, "[127.0.0.1]:2222");
        assert!(cleaned.contains("@cert-authority"));
        assert!(!cleaned.contains("[127.0.0.1]:2222 "));
        assert!(cleaned.contains("[127.0.0.1]:2223"));
    }

    #[test]
    fn known_hosts_add_entries_is_idempotent() {
        let once = known_hosts::add_entries("", "ssh-ed25519 AAAA", "[127.0.0.1]:2222", "ssh-ed25519 BBBB");
        let twice = known_hosts::add_entries(&once, "ssh-ed25519 AAAA", "[127.0.0.1]:2222", "ssh-ed25519 BBBB");
        assert_eq!(once, twice);
    }
}
