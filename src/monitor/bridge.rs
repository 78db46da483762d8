//! Control socket of a Monitor Process: terminal resize and stdio attach.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path as UrlPath, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Deserializer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;

use crate::container::RunState;
use crate::driver::DriverError;
use crate::stream::{StreamKind, encode};

use super::process::MonitorControl;

const RAW_STREAM: &str = "application/vnd.docker.raw-stream";

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("No such container: {0}")]
    NotFound(String),

    #[error("Container {0} is not running")]
    NotRunning(String),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = match &self {
            BridgeError::NotFound(_) => StatusCode::NOT_FOUND,
            BridgeError::NotRunning(_) | BridgeError::Driver(DriverError::NoTerminal) => {
                StatusCode::CONFLICT
            }
            BridgeError::Driver(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct ResizeParams {
    h: u16,
    w: u16,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct AttachParams {
    #[serde(default, deserialize_with = "flag")]
    stdin: bool,
    #[serde(default, deserialize_with = "flag")]
    stdout: bool,
    #[serde(default, deserialize_with = "flag")]
    stderr: bool,
    #[serde(default, deserialize_with = "flag")]
    logs: bool,
    #[serde(default, deserialize_with = "flag")]
    stream: bool,
}

/// Query flags arrive as `1`/`0` as often as `true`/`false`.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = String::deserialize(deserializer)?;
    Ok(matches!(value.as_str(), "1" | "true" | "True" | "yes"))
}

pub fn router(control: Arc<MonitorControl>) -> Router {
    Router::new()
        .route("/_ping", get(|| async { "OK" }))
        .route("/containers/{id}/resize", post(resize))
        .route("/containers/{id}/attach", post(attach))
        .with_state(control)
}

/// Serve the control surface on a Unix socket at `path`, replacing a stale one.
pub async fn serve(control: Arc<MonitorControl>, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("removed stale socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("Failed to remove stale control socket"),
    }
    let listener = tokio::net::UnixListener::bind(path)
        .with_context(|| format!("Failed to bind {}", path.display()))?;
    log::info!("control socket listening on {}", path.display());
    axum::serve(listener, router(control))
        .await
        .context("control socket server failed")
}

fn check_id(control: &MonitorControl, id: &str) -> Result<(), BridgeError> {
    if id == control.id() {
        Ok(())
    } else {
        Err(BridgeError::NotFound(id.to_string()))
    }
}

async fn resize(
    State(control): State<Arc<MonitorControl>>,
    UrlPath(id): UrlPath<String>,
    Query(params): Query<ResizeParams>,
) -> Result<StatusCode, BridgeError> {
    check_id(&control, &id)?;
    if control.status() != RunState::Running {
        return Err(BridgeError::NotRunning(id));
    }
    let terminal = control.terminal().ok_or(DriverError::NoTerminal)?;
    terminal.resize(params.h, params.w)?;
    Ok(StatusCode::OK)
}

async fn attach(
    State(control): State<Arc<MonitorControl>>,
    UrlPath(id): UrlPath<String>,
    Query(params): Query<AttachParams>,
    req: Request,
) -> Result<Response, BridgeError> {
    check_id(&control, &id)?;
    // Subscribe before a deferred start is released so no output is missed.
    let output = output_stream(&control, params);
    control.release_attach();

    if req.headers().contains_key(header::UPGRADE) {
        let on_upgrade = hyper::upgrade::on(req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    relay(&control, TokioIo::new(upgraded), output, params.stdin).await
                }
                Err(e) => log::warn!("attach upgrade failed: {e}"),
            }
        });
        return Ok((
            StatusCode::SWITCHING_PROTOCOLS,
            [
                (header::CONTENT_TYPE, RAW_STREAM),
                (header::CONNECTION, "Upgrade"),
                (header::UPGRADE, "tcp"),
            ],
        )
            .into_response());
    }

    if params.stdin
        && let Some(stdin) = control.streams().stdin()
    {
        let mut body = req.into_body().into_data_stream();
        tokio::spawn(async move {
            while let Some(Ok(chunk)) = body.next().await {
                if stdin.send(chunk).await.is_err() {
                    break;
                }
            }
        });
    }
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, RAW_STREAM)],
        Body::from_stream(output),
    )
        .into_response())
}

/// Copy the upgraded connection into stdin and the output stream back out.
async fn relay<S>(
    control: &MonitorControl,
    io: S,
    output: impl Stream<Item = std::io::Result<Bytes>>,
    stdin: bool,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(io);
    let input = match (stdin, control.streams().stdin()) {
        (true, Some(tx)) => Some(tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })),
        _ => None,
    };

    let mut output = std::pin::pin!(output);
    while let Some(Ok(chunk)) = output.next().await {
        if writer.write_all(&chunk).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
    if let Some(task) = input {
        task.abort();
    }
}

/// Logged output first (when asked for), then live output until the workload exits.
fn output_stream(
    control: &MonitorControl,
    params: AttachParams,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + use<> {
    let tty = control.tty();
    let mut stdout = params.stdout.then(|| control.streams().subscribe_stdout());
    let mut stderr = params.stderr.then(|| control.streams().subscribe_stderr());
    let replay: Vec<_> = if params.logs {
        control
            .streams()
            .read_logs()
            .unwrap_or_default()
            .into_iter()
            .filter(|entry| match entry.stream {
                StreamKind::Stdout => params.stdout,
                StreamKind::Stderr => params.stderr,
            })
            .collect()
    } else {
        vec![]
    };
    let live = params.stream;
    let exited = control.exited();

    async_stream::stream! {
        for entry in replay {
            yield Ok(encode(tty, entry.stream, entry.log.as_bytes()));
        }
        if !live {
            return;
        }
        loop {
            let next = tokio::select! {
                chunk = next_chunk(&mut stdout) => chunk.map(|c| (StreamKind::Stdout, c)),
                chunk = next_chunk(&mut stderr) => chunk.map(|c| (StreamKind::Stderr, c)),
                _ = exited.wait() => None,
            };
            match next {
                Some((kind, chunk)) => yield Ok(encode(tty, kind, &chunk)),
                None => break,
            }
        }
        for (kind, rx) in [(StreamKind::Stdout, &mut stdout), (StreamKind::Stderr, &mut stderr)] {
            if let Some(rx) = rx {
                while let Ok(chunk) = rx.try_recv() {
                    yield Ok(encode(tty, kind, &chunk));
                }
            }
        }
    }
}

/// Next chunk from an optional subscription; never resolves when not subscribed.
async fn next_chunk(rx: &mut Option<broadcast::Receiver<Bytes>>) -> Option<Bytes> {
    let Some(rx) = rx else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(chunk) => return Some(chunk),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("attach client lagged, dropped {n} chunks");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorEnv;
    use crate::driver::ExitStatus;
    use crate::monitor::process::testing::{ScriptedDriver, mark_running, write_container};
    use crate::monitor::process::{MonitorArgs, MonitorProcess};
    use crate::notify::RetryPolicy;
    use std::time::Duration;

    fn monitor(
        root: &std::path::Path,
        id: &str,
        configure: impl FnOnce(&mut crate::container::ContainerConfig),
    ) -> MonitorProcess {
        write_container(root, id, configure);
        let args = MonitorArgs {
            id: id.into(),
            containers_root: root.to_path_buf(),
            daemon_addr: "127.0.0.1:1".into(),
        };
        let env = MonitorEnv {
            notify: RetryPolicy {
                attempts: 1,
                delay: Duration::from_millis(1),
            },
            run_dir: root.to_path_buf(),
        };
        MonitorProcess::init(&args, &env).unwrap()
    }

    async fn serve_tcp(control: Arc<MonitorControl>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(control)).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_resize_errors() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path(), "r1", |_| {});
        let base = serve_tcp(monitor.control()).await;
        let client = reqwest::Client::new();

        let ping = client.get(format!("{base}/_ping")).send().await.unwrap();
        assert_eq!(ping.text().await.unwrap(), "OK");

        let wrong = client
            .post(format!("{base}/containers/other/resize?h=10&w=20"))
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status(), 404);

        let idle = client
            .post(format!("{base}/containers/r1/resize?h=10&w=20"))
            .send()
            .await
            .unwrap();
        assert_eq!(idle.status(), 409);

        let bad = client
            .post(format!("{base}/containers/r1/resize?h=tall"))
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status(), 400);
    }

    #[tokio::test]
    async fn test_resize_without_terminal_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path(), "r2", |_| {});
        let control = monitor.control();
        mark_running(&control, 5);
        let base = serve_tcp(control).await;

        let resp = reqwest::Client::new()
            .post(format!("{base}/containers/r2/resize?h=24&w=80"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
    }

    #[tokio::test]
    async fn test_attach_releases_deferred_start_and_streams_frames() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = Arc::new(monitor(dir.path(), "a1", |config| config.attach_stdout = true));
        let base = serve_tcp(monitor.control()).await;

        let run = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move {
                let driver = ScriptedDriver {
                    pid: 3,
                    output: b"hello",
                    outcome: || Ok(ExitStatus::from_code(0)),
                };
                monitor.start(&driver).await
            })
        };

        let resp = reqwest::Client::new()
            .post(format!("{base}/containers/a1/attach?stdout=1&stream=1"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], RAW_STREAM);
        let body = tokio::time::timeout(Duration::from_secs(5), resp.bytes())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&body[..8], &[1, 0, 0, 0, 0, 0, 0, 5]);
        assert_eq!(&body[8..], b"hello");
        assert_eq!(run.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_attach_replays_logs() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path(), "l1", |_| {});
        let driver = ScriptedDriver {
            pid: 3,
            output: b"earlier",
            outcome: || Ok(ExitStatus::from_code(0)),
        };
        monitor.start(&driver).await;
        let base = serve_tcp(monitor.control()).await;

        let body = reqwest::Client::new()
            .post(format!("{base}/containers/l1/attach?stdout=true&logs=true"))
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&body[8..], b"earlier");
    }
}
