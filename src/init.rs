//! Control-Plane Initializer (§4.10): retry-posts the init payload to the
//! in-container HTTP endpoint, carrying the SSH artifacts the container
//! needs to trust the host.
//!
//! The retry loop mirrors the teacher's connection-setup idiom in
//! `docker.rs` (resolve a transport, then treat early failures as
//! retryable rather than fatal) generalized from "try once" to a bounded
//! poll.

use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Errors raised while initializing the control plane.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    /// Every retry attempt failed to connect.
    #[error("could not reach in-container agent after {attempts} attempts")]
    Unreachable {
        /// Number of attempts made.
        attempts: u32,
    },

    /// The agent responded with a non-2xx status.
    #[error("init rejected by agent: {body}")]
    Rejected {
        /// Response body returned by the agent.
        body: String,
    },

    /// The request was cancelled before succeeding.
    #[error("init cancelled")]
    Cancelled,
}

/// Request body posted to `/init` (§4.10, §6).
#[derive(Debug, Serialize)]
pub struct InitPayload {
    /// Host-visible address external tooling should connect to.
    pub host_address: String,
    /// `Ok(())` if SSH came up; the error text otherwise.
    pub ssh_availability: Result<(), String>,
    /// In-container SSH server's public identity.
    pub server_identity_public: String,
    /// Authorized client public keys.
    pub authorized_public_keys: Vec<String>,
    /// Certificate authority public key.
    pub ca_public_key: String,
    /// Host certificate (OpenSSH text).
    pub host_certificate: String,
}

/// POSTs `payload` to `http://<host>:<container80>/init`, retrying every
/// [`RETRY_INTERVAL`] up to `max_attempts` times on connection failure
/// (logging every 10th attempt). Never called before the container has
/// started (§5 ordering guarantee).
pub async fn run(
    host: &str,
    container_port_80: u16,
    payload: &InitPayload,
    max_attempts: u32,
    cancel: &CancellationToken,
) -> Result<(), InitError> {
    let client: Client<HttpConnector, Full<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
    let uri: hyper::Uri = format!("http://{host}:{container_port_80}/init")
        .parse()
        .expect("host/port produce a valid URI");
    let body = serde_json::to_vec(payload).expect("InitPayload always serializes");

    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            return Err(InitError::Cancelled);
        }

        let req = hyper::Request::post(uri.clone())
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.clone())))
            .expect("static request is well-formed");

        match client.request(req).await {
            Ok(resp) => {
                let status = resp.status();
                let body_bytes = resp
                    .into_body()
                    .collect()
                    .await
                    .map(|c| c.to_bytes())
                    .unwrap_or_default();
                if status.is_success() {
                    return Ok(());
                }
                return Err(InitError::Rejected {
                    body: String::from_utf8_lossy(&body_bytes).into_owned(),
                });
            }
            Err(e) => {
                if attempt % 10 == 0 {
                    log::debug!("init attempt {attempt}/{max_attempts} failed: {e}");
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(InitError::Cancelled),
                    _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                }
            }
        }
    }

    Err(InitError::Unreachable { attempts: max_attempts })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> InitPayload {
        InitPayload {
            host_address: "127.0.0.1:8080".to_string(),
            ssh_availability: Ok(()),
            server_identity_public: "ssh-ed25519 AAAA".to_string(),
            authorized_public_keys: vec!["ssh-ed25519 BBBB".to_string()],
            ca_public_key: "ssh-ed25519 CCCC".to_string(),
            host_certificate: "ssh-ed25519-cert-v01@openssh.com DDDD".to_string(),
        }
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        // Port 1 is typically unroutable/refused quickly in test sandboxes;
        // a handful of attempts is enough to exercise the give-up path.
        let cancel = CancellationToken::new();
        let result = run("127.0.0.1", 1, &payload(), 3, &cancel).await;
        assert!(matches!(result, Err(InitError::Unreachable { attempts: 3 })));
    }

    #[tokio::test]
    async fn cancellation_short_circuits_retries() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run("127.0.0.1", 1, &payload(), 100, &cancel).await;
        assert!(matches!(result, Err(InitError::Cancelled)));
    }
}
