//! Port Tunnel Manager (§4.11, §3): polls in-container port events and
//! maintains a bounded set of local-forward SSH tunnels.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::process;

/// System ports never eligible for tunneling (§3 Invariant 4).
const SYSTEM_PORTS: &[u16] = &[22, 25, 53, 80, 110, 143, 443, 993, 995];

const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// Errors raised by the Port Tunnel Manager.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// The port-events endpoint could not be reached or returned malformed JSON.
    #[error("failed to poll port events: {0}")]
    Poll(String),

    /// Spawning the `ssh -L` subprocess failed.
    #[error(transparent)]
    Process(#[from] process::ProcessError),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EventType {
    Opened,
    Closed,
}

#[derive(Debug, Deserialize)]
struct PortEvent {
    #[serde(rename = "type")]
    kind: EventType,
    port: String,
    timestamp: DateTime<Utc>,
}

fn is_system_port(port: u16) -> bool {
    SYSTEM_PORTS.contains(&port)
}

/// Extracts the trailing port number from `"tcp:<addr>:<port>"`.
fn parse_port(spec: &str) -> Option<u16> {
    spec.rsplit(':').next()?.parse().ok()
}

struct Tunnel {
    cancel: CancellationToken,
}

/// Bounded mapping from container port to an active local-forward tunnel.
pub struct TunnelRegistry {
    ceiling: usize,
    tunnels: Mutex<HashMap<u16, Tunnel>>,
}

impl TunnelRegistry {
    /// Creates an empty registry with capacity `ceiling`.
    pub fn new(ceiling: usize) -> Arc<Self> {
        Arc::new(Self {
            ceiling,
            tunnels: Mutex::new(HashMap::new()),
        })
    }

    /// Current number of live tunnels.
    pub async fn len(&self) -> usize {
        self.tunnels.lock().await.len()
    }

    async fn open(
        self: &Arc<Self>,
        port: u16,
        ssh_binary: &str,
        ssh_host_alias: &str,
        cancel: &CancellationToken,
    ) -> Result<(), TunnelError> {
        {
            let tunnels = self.tunnels.lock().await;
            if tunnels.contains_key(&port) {
                return Ok(());
            }
            if tunnels.len() >= self.ceiling {
                log::warn!("tunnel registry at ceiling ({}), dropping port {port}", self.ceiling);
                return Ok(());
            }
        }

        let tunnel_cancel = cancel.child_token();
        let args = vec![
            "-L".to_string(),
            format!("{port}:127.0.0.1:{port}"),
            "-N".to_string(),
            "-T".to_string(),
            ssh_host_alias.to_string(),
        ];

        self.tunnels.lock().await.insert(port, Tunnel {
            cancel: tunnel_cancel.clone(),
        });

        let registry = self.clone();
        let ssh_binary = ssh_binary.to_string();
        tokio::spawn(async move {
            let result = process::run_streaming(&ssh_binary, &args, &tunnel_cancel).await;
            if let Err(e) = result {
                log::debug!("tunnel for port {port} exited: {e}");
            }
            registry.tunnels.lock().await.remove(&port);
        });

        Ok(())
    }

    async fn close(&self, port: u16) {
        if let Some(tunnel) = self.tunnels.lock().await.remove(&port) {
            tunnel.cancel.cancel();
        }
    }

    /// Cancels every registered tunnel; each monitor removes its own entry.
    pub async fn shutdown_all(&self) {
        let tunnels = self.tunnels.lock().await;
        for tunnel in tunnels.values() {
            tunnel.cancel.cancel();
        }
    }
}

async fn fetch_port_events(
    client: &Client<HttpConnector, Empty<Bytes>>,
    base_url: &str,
    since: DateTime<Utc>,
) -> Result<Vec<PortEvent>, TunnelError> {
    let uri: hyper::Uri = format!("{base_url}/port-events?since={}", since.to_rfc3339())
        .parse()
        .map_err(|e: http::uri::InvalidUri| TunnelError::Poll(e.to_string()))?;
    let resp = client
        .get(uri)
        .await
        .map_err(|e| TunnelError::Poll(e.to_string()))?;
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| TunnelError::Poll(e.to_string()))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|e| TunnelError::Poll(e.to_string()))
}

/// Runs the poll loop until `cancel` fires: every [`POLL_INTERVAL`], fetches
/// port events since the last poll, opens/closes tunnels accordingly, and
/// advances `lastPollTime` to the maximum event timestamp seen (§4.11
/// Ordering).
pub async fn run(
    registry: Arc<TunnelRegistry>,
    base_url: String,
    ssh_binary: String,
    ssh_host_alias: String,
    cancel: CancellationToken,
) {
    let client: Client<HttpConnector, Empty<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
    let mut since = Utc::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let events = match fetch_port_events(&client, &base_url, since).await {
            Ok(events) => events,
            Err(e) => {
                log::debug!("port-events poll failed: {e}");
                continue;
            }
        };

        let mut max_ts = since;
        for event in &events {
            if event.timestamp > max_ts {
                max_ts = event.timestamp;
            }
            let Some(port) = parse_port(&event.port) else {
                continue;
            };
            if is_system_port(port) {
                continue;
            }
            match event.kind {
                EventType::Opened => {
                    if let Err(e) = registry.open(port, &ssh_binary, &ssh_host_alias, &cancel).await {
                        log::warn!("failed to open tunnel for port {port}: {e}");
                    }
                }
                EventType::Closed => registry.close(port).await,
            }
        }
        since = max_ts;
    }

    registry.shutdown_all().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trailing_port() {
        assert_eq!(parse_port("tcp:0.0.0.0:8080"), Some(8080));
        assert_eq!(parse_port("tcp:[::]:3000"), Some(3000));
        assert_eq!(parse_port("garbage"), None);
    }

    #[test]
    fn system_ports_are_excluded() {
        for p in [22, 25, 53, 80, 110, 143, 443, 993, 995] {
            assert!(is_system_port(p));
        }
        assert!(!is_system_port(8080));
    }

    #[tokio::test]
    async fn ceiling_is_respected() {
        let registry = TunnelRegistry::new(1);
        let cancel = CancellationToken::new();
        registry.open(1000, "ssh", "sketch-x", &cancel).await.unwrap();
        registry.open(1001, "ssh", "sketch-x", &cancel).await.unwrap();
        assert_eq!(registry.len().await, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn duplicate_open_is_idempotent() {
        let registry = TunnelRegistry::new(4);
        let cancel = CancellationToken::new();
        registry.open(1000, "ssh", "sketch-x", &cancel).await.unwrap();
        registry.open(1000, "ssh", "sketch-x", &cancel).await.unwrap();
        assert_eq!(registry.len().await, 1);
        cancel.cancel();
    }
}
