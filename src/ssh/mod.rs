//! SSH Identity & Certificate Manager (§4.8): persistent server/user
//! identities, an ephemeral per-run certificate authority, host certificate
//! issuance, and non-destructive edits to the user's client configuration
//! and trust store.
//!
//! Generalizes the teacher's `ssh.rs` (which shells a `tokio::process`
//! child to speak the Docker daemon's SSH transport) into key management:
//! the shelling-out pattern there becomes `container::run_streaming`-style
//! subprocess use for the actual tunnel SSH client in [`crate::tunnel`], and
//! this module owns everything that happens before a connection is ever
//! opened.

pub mod client_config;
pub mod safe_write;

use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use rand_core::OsRng;
use ssh_key::certificate::{Builder, CertType};
use ssh_key::{Algorithm, LineEnding, PrivateKey, PublicKey};

use self::client_config::{known_hosts, ClientConfigEdit};
use self::safe_write::{write_file, SafeWriteError};

/// Errors raised by the SSH identity/certificate manager.
#[derive(Debug, thiserror::Error)]
pub enum SshError {
    /// Key generation failed.
    #[error("failed to generate {0} keypair: {1}")]
    KeyGen(&'static str, ssh_key::Error),

    /// An existing key file on disk could not be parsed.
    #[error("failed to parse existing key at {path}: {source}")]
    KeyParse {
        /// Path of the unreadable key file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: ssh_key::Error,
    },

    /// Certificate construction or signing failed.
    #[error("failed to build host certificate: {0}")]
    Certificate(ssh_key::Error),

    /// A file write via the Safe-Write protocol failed.
    #[error(transparent)]
    Write(#[from] SafeWriteError),

    /// A filesystem operation outside of Safe-Write failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

/// Validity window length mandated by Testable Property 7: exactly 31 hours
/// (`now - 1h` through `now + 30h`). Note this supersedes the looser prose in
/// §3/§4.8 ("now+30d"), which would not satisfy the 31-hour invariant; see
/// `DESIGN.md`'s Open Question decisions.
fn validity_window() -> (u64, u64) {
    let now = Utc::now();
    let valid_after = now - Duration::hours(1);
    let valid_before = now + Duration::hours(30);
    (
        valid_after.timestamp().max(0) as u64,
        valid_before.timestamp().max(0) as u64,
    )
}

/// Persistent or ephemeral ed25519 keypair, serialized as OpenSSH text.
#[derive(Debug, Clone)]
pub struct KeyPair {
    /// OpenSSH private key text (PEM-like), mode 0600 on disk.
    pub private_openssh: String,
    /// OpenSSH public key line, mode 0644 on disk.
    pub public_openssh: String,
}

impl KeyPair {
    fn generate(purpose: &'static str) -> Result<(Self, PrivateKey), SshError> {
        let private = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|e| SshError::KeyGen(purpose, e))?;
        let public = private.public_key().to_owned();
        let pair = KeyPair {
            private_openssh: private
                .to_openssh(LineEnding::LF)
                .map_err(|e| SshError::KeyGen(purpose, e))?
                .to_string(),
            public_openssh: public.to_openssh().map_err(|e| SshError::KeyGen(purpose, e))?,
        };
        Ok((pair, private))
    }
}

/// Loads a persistent ed25519 keypair from `<dir>/<name>{,.pub}`, generating
/// and persisting one (via Safe-Write) if absent.
fn load_or_generate_persistent(
    dir: &Path,
    name: &str,
) -> Result<(KeyPair, PrivateKey), SshError> {
    let priv_path = dir.join(name);
    let pub_path = dir.join(format!("{name}.pub"));

    if priv_path.exists() && pub_path.exists() {
        let private_text = std::fs::read_to_string(&priv_path).map_err(|source| SshError::Io {
            path: priv_path.clone(),
            source,
        })?;
        let public_text = std::fs::read_to_string(&pub_path).map_err(|source| SshError::Io {
            path: pub_path.clone(),
            source,
        })?;
        let private = PrivateKey::from_openssh(&private_text).map_err(|source| SshError::KeyParse {
            path: priv_path.clone(),
            source,
        })?;
        return Ok((
            KeyPair {
                private_openssh: private_text,
                public_openssh: public_text,
            },
            private,
        ));
    }

    let (pair, private) = KeyPair::generate(name)?;
    write_file(&priv_path, pair.private_openssh.as_bytes(), 0o600)?;
    write_file(&pub_path, pair.public_openssh.as_bytes(), 0o644)?;
    Ok((pair, private))
}

/// Generates an ephemeral keypair and writes it to `<dir>/<name>{,.pub}`,
/// overwriting any prior run's ephemeral material (§4.8: CA and host cert
/// are regenerated per run).
fn generate_ephemeral(dir: &Path, name: &str) -> Result<(KeyPair, PrivateKey), SshError> {
    let (pair, private) = KeyPair::generate(name)?;
    write_file(&dir.join(name), pair.private_openssh.as_bytes(), 0o600)?;
    write_file(&dir.join(format!("{name}.pub")), pair.public_openssh.as_bytes(), 0o644)?;
    Ok((pair, private))
}

/// Every artifact the SSH fabric produces for one session.
#[derive(Debug, Clone)]
pub struct SshArtifacts {
    /// Presented by the in-container SSH server.
    pub server_identity: KeyPair,
    /// Client identity used to connect into containers.
    pub user_identity: KeyPair,
    /// Ephemeral, per-run certificate authority.
    pub ca: KeyPair,
    /// Host certificate (a user certificate, principal `root`, signed by `ca`)
    /// presented by the host when authenticating to the container.
    pub host_cert_openssh: String,
    /// Resolved host-side SSH port availability, or the error text if SSH
    /// could not be brought up (§4.12 step 11; never fatal to the run).
    pub availability: Result<(), String>,
}

/// Paths under `<user-config>/sketch/` and `<user-cache>/sketch/` the
/// manager reads and writes.
#[derive(Debug, Clone)]
pub struct SshPaths {
    /// `<user-config>/sketch`
    pub config_dir: PathBuf,
}

impl SshPaths {
    /// The sketch-owned ssh client config include file.
    pub fn client_config_path(&self) -> PathBuf {
        self.config_dir.join("ssh_config")
    }

    /// The sketch-owned known-hosts file.
    pub fn known_hosts_path(&self) -> PathBuf {
        self.config_dir.join("known_hosts")
    }
}

/// Brings up the SSH fabric for one session: loads/generates persistent
/// identities, generates a fresh CA and host certificate, and updates the
/// sketch-owned client config and known-hosts files. Never fails the overall
/// run; SSH unavailability is recorded in `SshArtifacts::availability`
/// instead (§4.12 step 11).
pub fn bring_up(
    paths: &SshPaths,
    session_id: &str,
    ssh_host: &str,
    ssh_port: u16,
) -> Result<SshArtifacts, SshError> {
    std::fs::create_dir_all(&paths.config_dir).map_err(|source| SshError::Io {
        path: paths.config_dir.clone(),
        source,
    })?;

    let (server_identity, _server_private) =
        load_or_generate_persistent(&paths.config_dir, "container_server_identity")?;
    let (user_identity, _user_private) =
        load_or_generate_persistent(&paths.config_dir, "container_user_identity")?;
    let (ca, ca_private) = generate_ephemeral(&paths.config_dir, "container_ca")?;

    let user_public = PublicKey::from_openssh(&user_identity.public_openssh)
        .map_err(|source| SshError::KeyParse {
            path: paths.config_dir.join("container_user_identity.pub"),
            source,
        })?;

    let (valid_after, valid_before) = validity_window();
    let mut builder = Builder::new_with_random_nonce(&mut OsRng, &user_public, valid_after, valid_before)
        .map_err(SshError::Certificate)?;
    builder
        .serial(1)
        .and_then(|b| b.key_id(format!("sketch-{session_id}")))
        .and_then(|b| b.cert_type(CertType::User))
        .and_then(|b| b.valid_principal("root"))
        .and_then(|b| b.critical_option("source-address", "127.0.0.1,::1"))
        .and_then(|b| b.extension("permit-pty", ""))
        .and_then(|b| b.extension("permit-agent-forwarding", ""))
        .and_then(|b| b.extension("permit-port-forwarding", ""))
        .map_err(SshError::Certificate)?;
    let cert = builder.sign(&ca_private).map_err(SshError::Certificate)?;
    let host_cert_openssh = cert.to_openssh().map_err(SshError::Certificate)?;

    write_file(
        &paths.config_dir.join("host_cert"),
        host_cert_openssh.as_bytes(),
        0o644,
    )?;

    let client_config_path = paths.client_config_path();
    let known_hosts_path = paths.known_hosts_path();

    let mut edit = ClientConfigEdit::load(&client_config_path).map_err(|source| SshError::Io {
        path: client_config_path.clone(),
        source,
    })?;
    edit.ensure_pattern_block(&paths.config_dir.join("container_user_identity"), &known_hosts_path);
    edit.set_session_host(
        session_id,
        ssh_host,
        ssh_port,
        &paths.config_dir.join("container_user_identity"),
        &paths.config_dir.join("host_cert"),
        &known_hosts_path,
    );
    edit.save(&client_config_path)?;

    let existing_known_hosts = std::fs::read_to_string(&known_hosts_path).unwrap_or_default();
    let host_port = format!("[{ssh_host}]:{ssh_port}");
    let new_known_hosts = known_hosts::add_entries(
        &existing_known_hosts,
        &ca.public_openssh,
        &host_port,
        &server_identity.public_openssh,
    );
    write_file(&known_hosts_path, new_known_hosts.as_bytes(), 0o644)?;

    Ok(SshArtifacts {
        server_identity,
        user_identity,
        ca,
        host_cert_openssh,
        availability: Ok(()),
    })
}

/// Removes only the per-session host block and host-key line for
/// `session_id`; CA lines and peer sessions' blocks are preserved
/// (Testable Property 6).
pub fn cleanup(paths: &SshPaths, session_id: &str, ssh_host: &str, ssh_port: u16) -> Result<(), SshError> {
    let client_config_path = paths.client_config_path();
    if let Ok(mut edit) = ClientConfigEdit::load(&client_config_path) {
        edit.remove_session_host(session_id);
        edit.save(&client_config_path)?;
    }

    let known_hosts_path = paths.known_hosts_path();
    if let Ok(existing) = std::fs::read_to_string(&known_hosts_path) {
        let host_port = format!("[{ssh_host}]:{ssh_port}");
        let cleaned = known_hosts::remove_session_entry(&existing, &host_port);
        write_file(&known_hosts_path, cleaned.as_bytes(), 0o644)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_window_is_31_hours() {
        let (after, before) = validity_window();
        assert_eq!(before - after, 31 * 3600);
    }

    #[test]
    fn bring_up_and_cleanup_preserve_peer_sessions() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = SshPaths {
            config_dir: tmp.path().to_path_buf(),
        };

        let artifacts_a = bring_up(&paths, "aaa", "127.0.0.1", 2222).unwrap();
        let artifacts_b = bring_up(&paths, "bbb", "127.0.0.1", 2223).unwrap();
        assert!(artifacts_a.availability.is_ok());
        assert!(artifacts_b.availability.is_ok());

        cleanup(&paths, "aaa", "127.0.0.1", 2222).unwrap();

        let cfg = std::fs::read_to_string(paths.client_config_path()).unwrap();
        assert!(!cfg.contains("Host sketch-aaa"));
        assert!(cfg.contains("Host sketch-bbb"));
        assert!(cfg.contains("Host sketch-*"));

        let known_hosts = std::fs::read_to_string(paths.known_hosts_path()).unwrap();
        assert!(known_hosts.contains("@cert-authority"));
        assert!(!known_hosts.contains("[127.0.0.1]:2222 "));
        assert!(known_hosts.contains("[127.0.0.1]:2223"));
    }

    #[test]
    fn persistent_identities_are_stable_across_calls() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = SshPaths {
            config_dir: tmp.path().to_path_buf(),
        };
        let a = bring_up(&paths, "s1", "127.0.0.1", 2222).unwrap();
        let b = bring_up(&paths, "s2", "127.0.0.1", 2223).unwrap();
        // Persistent identities must not change across runs...
        assert_eq!(a.server_identity.public_openssh, b.server_identity.public_openssh);
        assert_eq!(a.user_identity.public_openssh, b.user_identity.public_openssh);
        // ...but the CA is regenerated every run.
        assert_ne!(a.ca.public_openssh, b.ca.public_openssh);
    }
}
