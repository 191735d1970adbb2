//! Source-Control HTTP Bridge (§4.7): an authenticated loopback HTTP
//! endpoint wrapping the source-control binary's CGI backend, with a
//! single-slot browser-launch channel and a best-effort upstream pre-fetch.
//!
//! Turns the teacher's client-side `hyper`/`hyper-util` transport stack
//! (`docker.rs`'s `Docker` client, built on `hyper_util::client::legacy`)
//! around into a server built on `hyper::server::conn::auto` and
//! `hyper_util::rt::TokioIo`, which the teacher never needed because it only
//! ever dials out to the daemon.

pub mod hooks;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::process;
use crate::redact::redact_secret;

const BASIC_AUTH_USER: &str = "sketch";
const UPSTREAM_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default browser-launch command for the host platform, used by
/// [`SourceControlBridge::spawn_browser_launcher`].
#[cfg(target_os = "macos")]
pub const DEFAULT_BROWSER_LAUNCHER: &str = "open";
#[cfg(not(target_os = "macos"))]
pub const DEFAULT_BROWSER_LAUNCHER: &str = "xdg-open";

/// Errors raised while starting or running the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The loopback listener could not be bound.
    #[error("failed to bind bridge listener: {0}")]
    Bind(std::io::Error),

    /// Hook script materialization failed.
    #[error(transparent)]
    Hooks(#[from] crate::ssh::safe_write::SafeWriteError),
}

/// Shared state behind the bridge's request handler.
struct Shared {
    secret: String,
    scm_binary: String,
    repo_root: PathBuf,
    hooks_dir: Option<PathBuf>,
    upstream_url: Option<String>,
    browser_url: Mutex<Option<String>>,
    browser_tx: mpsc::Sender<()>,
}

/// A running bridge instance: holds the port it bound and the handle needed
/// to shut it down.
pub struct SourceControlBridge {
    /// Ephemeral loopback port the bridge is listening on.
    pub port: u16,
    /// The session's shared secret, for embedding in URLs passed to the container.
    pub secret: String,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    browser_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl std::fmt::Debug for SourceControlBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceControlBridge")
            .field("port", &self.port)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl SourceControlBridge {
    /// Binds an ephemeral loopback port and starts serving; returns once the
    /// listener is open (§5 ordering guarantee: bridge is open before the
    /// container is created).
    pub async fn start(
        secret: String,
        scm_binary: String,
        repo_root: PathBuf,
        hooks_dir: Option<PathBuf>,
        upstream_url: Option<String>,
        cancel: CancellationToken,
    ) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(BridgeError::Bind)?;
        let port = listener.local_addr().map_err(BridgeError::Bind)?.port();

        if let Some(dir) = &hooks_dir {
            if upstream_url.is_some() {
                hooks::materialize(dir)?;
            }
        }

        let (browser_tx, browser_rx) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            secret,
            scm_binary,
            repo_root,
            hooks_dir,
            upstream_url,
            browser_url: Mutex::new(None),
            browser_tx,
        });

        let accept_shared = shared.clone();
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { continue };
                        let shared = accept_shared.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let svc = service_fn(move |req| handle(shared.clone(), peer, req));
                            let _ = auto::Builder::new(TokioExecutor::new())
                                .serve_connection(io, svc)
                                .await;
                        });
                    }
                }
            }
        });

        Ok(Self {
            port,
            secret: shared.secret.clone(),
            shared,
            cancel,
            browser_rx: Mutex::new(Some(browser_rx)),
        })
    }

    /// Records the "open this URL" string surfaced by `POST /browser`.
    pub fn set_browser_url(&self, url: String) {
        *self.shared.browser_url.lock().unwrap() = Some(url);
    }

    /// Stores `url` and immediately triggers a launch, the same way a
    /// `POST /browser` request would.
    pub fn open_browser(&self, url: String) {
        self.set_browser_url(url);
        let _ = self.shared.browser_tx.try_send(());
    }

    /// Takes the receiver for browser-launch events; callable once.
    pub fn take_browser_events(&self) -> Option<mpsc::Receiver<()>> {
        self.browser_rx.lock().unwrap().take()
    }

    /// Drains browser-launch events for the lifetime of `cancel`, running
    /// `launcher <url>` through the Process Runner each time one fires.
    /// A no-op past the first call (the receiver is only available once).
    pub fn spawn_browser_launcher(&self, launcher: String, cancel: CancellationToken) {
        let Some(mut rx) = self.take_browser_events() else {
            return;
        };
        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                        let url = shared.browser_url.lock().unwrap().clone();
                        let Some(url) = url else { continue };
                        if let Err(e) = process::run_allow_failure(&launcher, &[url.as_str()], &cancel).await {
                            log::warn!("failed to launch browser via {launcher}: {e}");
                        }
                    }
                }
            }
        });
    }

    /// Shuts down the listener and any in-flight connections.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

fn unauthorized() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(WWW_AUTHENTICATE, "Basic realm=\"sketch\"")
        .body(Full::new(Bytes::new()))
        .expect("static response is well-formed")
}

#[cfg(target_os = "macos")]
fn is_loopback(addr: SocketAddr) -> bool {
    addr.ip().is_loopback()
}

fn check_auth(shared: &Shared, req: &Request<Incoming>) -> bool {
    let Some(header) = req.headers().get(AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = header.to_str() else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    use base64::Engine;
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let expected = format!("{BASIC_AUTH_USER}:{}", shared.secret);
    decoded.ct_eq(expected.as_bytes()).into()
}

async fn handle(
    shared: Arc<Shared>,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    #[cfg(target_os = "macos")]
    if !is_loopback(peer) {
        return Ok(Response::builder()
            .status(StatusCode::FORBIDDEN)
            .body(Full::new(Bytes::new()))
            .unwrap());
    }
    let _ = peer;

    if !check_auth(&shared, &req) {
        return Ok(unauthorized());
    }

    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    if path == "/browser" {
        if req.method() != hyper::Method::POST {
            return Ok(Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .body(Full::new(Bytes::new()))
                .unwrap());
        }
        return Ok(match shared.browser_tx.try_send(()) {
            Ok(()) => Response::new(Full::new(Bytes::new())),
            Err(_) => Response::builder()
                .status(StatusCode::TOO_MANY_REQUESTS)
                .body(Full::new(Bytes::new()))
                .unwrap(),
        });
    }

    if path.ends_with("/info/refs") && query.contains("service=git-upload-pack") {
        if let Some(upstream) = shared.upstream_url.clone() {
            let scm_binary = shared.scm_binary.clone();
            let repo_root = shared.repo_root.clone();
            tokio::spawn(async move {
                let fetch = Command::new(&scm_binary)
                    .arg("-C")
                    .arg(&repo_root)
                    .arg("fetch")
                    .arg(&upstream)
                    .output();
                if tokio::time::timeout(UPSTREAM_FETCH_TIMEOUT, fetch).await.is_err() {
                    log::debug!("background upstream fetch from {upstream} timed out");
                }
            });
        }
    }

    match run_cgi(&shared, &path, &query, req).await {
        Ok(resp) => Ok(resp),
        Err(detail) => {
            log::error!("source-control CGI handler failed: {detail}");
            Ok(Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::from("internal error")))
                .unwrap())
        }
    }
}

/// Execs the source-control binary's HTTP CGI backend, normalizing a leading
/// `/.git` out of `PATH_INFO` for a bare on-disk layout, granting export-all,
/// push, and repack.
async fn run_cgi(
    shared: &Shared,
    path: &str,
    query: &str,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, String> {
    let path_info = path.strip_prefix("/.git").unwrap_or(path).to_string();
    let method = req.method().to_string();
    let content_type = req
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| e.to_string())?
        .to_bytes();

    let mut cmd = Command::new(&shared.scm_binary);
    cmd.arg("http-backend")
        .env("GIT_PROJECT_ROOT", &shared.repo_root)
        .env("GIT_HTTP_EXPORT_ALL", "1")
        .env("REQUEST_METHOD", &method)
        .env("PATH_INFO", &path_info)
        .env("QUERY_STRING", query)
        .env("CONTENT_TYPE", &content_type)
        .env("CONTENT_LENGTH", body.len().to_string())
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    if let Some(hooks_dir) = &shared.hooks_dir {
        cmd.env("GIT_HTTP_BACKEND_HOOKS_DIR", hooks_dir);
    }

    let mut child = cmd.spawn().map_err(|e| e.to_string())?;
    {
        use tokio::io::AsyncWriteExt;
        let mut stdin = child.stdin.take().expect("piped stdin");
        stdin.write_all(&body).await.map_err(|e| e.to_string())?;
    }
    let output = child.wait_with_output().await.map_err(|e| e.to_string())?;
    if !output.status.success() {
        return Err(redact_secret(
            &String::from_utf8_lossy(&output.stderr),
            &shared.secret,
        ));
    }

    parse_cgi_response(&output.stdout)
}

/// Splits a CGI response into headers and body at the first blank line, per
/// the CGI/1.1 protocol `git http-backend` speaks.
fn parse_cgi_response(raw: &[u8]) -> Result<Response<Full<Bytes>>, String> {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, 4))
        .or_else(|| raw.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2)));
    let Some((idx, sep_len)) = split else {
        return Ok(Response::new(Full::new(Bytes::copy_from_slice(raw))));
    };
    let header_text = String::from_utf8_lossy(&raw[..idx]);
    let body = Bytes::copy_from_slice(&raw[idx + sep_len..]);

    let mut builder = Response::builder();
    let mut status = StatusCode::OK;
    for line in header_text.split(['\n', '\r']).filter(|l| !l.is_empty()) {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("status") {
                if let Some(code) = value.split_whitespace().next() {
                    status = code.parse().unwrap_or(StatusCode::OK);
                }
            } else {
                builder = builder.header(name, value);
            }
        }
    }
    builder.status(status).body(Full::new(body)).map_err(|e| e.to_string())
}
