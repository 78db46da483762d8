//! Execution driver seam.
//!
//! A driver launches the workload described by a [`ProcessSpec`], tells the
//! caller through a [`StartHook`] once the OS process exists, and returns its
//! [`ExitStatus`] after it has been reaped. Namespace and cgroup isolation are
//! the driver's business; [`ProcessDriver`] runs the command directly.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::stream::OutputSink;

/// How long output forwarders may keep draining after the process is reaped.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// The command a container runs, persisted as `command.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub entrypoint: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// `KEY=value` entries; this is the complete environment of the workload.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub open_stdin: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub exit_code: i32,
    /// Terminated by a signal; `exit_code` is then `128 + signal`.
    #[serde(default)]
    pub signaled: bool,
    #[serde(default)]
    pub oom_killed: bool,
}

impl ExitStatus {
    pub fn from_code(exit_code: i32) -> Self {
        Self {
            exit_code,
            signaled: false,
            oom_killed: false,
        }
    }

    pub fn from_std(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            Self::from_code(code)
        } else if let Some(signal) = status.signal() {
            Self {
                exit_code: 128 + signal,
                signaled: true,
                oom_killed: false,
            }
        } else {
            Self::from_code(-1)
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("failed to launch {entrypoint}: {source}")]
    Spawn {
        entrypoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to allocate a terminal: {0}")]
    Terminal(#[source] std::io::Error),

    #[error("failed waiting for process {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("container has no terminal")]
    NoTerminal,

    #[error("failed to resize terminal: {0}")]
    Resize(#[source] std::io::Error),
}

impl DriverError {
    /// Exit code recorded when the workload never ran.
    pub fn exit_code(&self) -> i32 {
        match self {
            DriverError::Spawn { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => 127,
                std::io::ErrorKind::PermissionDenied => 126,
                _ => 125,
            },
            _ => 125,
        }
    }
}

/// Master side of a workload's pseudo-terminal.
#[derive(Debug, Clone)]
pub struct Terminal {
    master: Arc<OwnedFd>,
}

impl Terminal {
    pub fn resize(&self, height: u16, width: u16) -> Result<(), DriverError> {
        let winsize = libc::winsize {
            ws_row: height,
            ws_col: width,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let result = unsafe {
            libc::ioctl(
                self.master.as_raw_fd(),
                libc::TIOCSWINSZ,
                &winsize as *const libc::winsize,
            )
        };
        if result == -1 {
            Err(DriverError::Resize(std::io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }
}

/// Fired once the workload process exists. May be invoked more than once by
/// a misbehaving driver; implementations must tolerate that.
pub trait StartHook: Send + Sync {
    fn started(&self, pid: u32, terminal: Option<Terminal>);
}

/// I/O plumbing handed to a driver for one run.
pub struct Pipes {
    pub stdin: Option<mpsc::Receiver<Bytes>>,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

#[async_trait]
pub trait ExecDriver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        spec: &ProcessSpec,
        pipes: Pipes,
        hook: &dyn StartHook,
    ) -> Result<ExitStatus, DriverError>;
}

/// Runs the command as a plain child process.
#[derive(Debug, Default, Clone)]
pub struct ProcessDriver;

impl ProcessDriver {
    pub fn new() -> Self {
        Self
    }

    fn command(spec: &ProcessSpec) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&spec.entrypoint);
        cmd.args(&spec.arguments).env_clear();
        for entry in &spec.env {
            match entry.split_once('=') {
                Some((key, value)) => cmd.env(key, value),
                None => cmd.env(entry, ""),
            };
        }
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    async fn run_piped(
        spec: &ProcessSpec,
        pipes: Pipes,
        hook: &dyn StartHook,
    ) -> Result<ExitStatus, DriverError> {
        let mut cmd = Self::command(spec);
        cmd.stdin(if pipes.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| DriverError::Spawn {
            entrypoint: spec.entrypoint.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();

        let mut forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(tokio::spawn(forward_output(stdout, pipes.stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(tokio::spawn(forward_output(stderr, pipes.stderr)));
        }
        let stdin_task = match (child.stdin.take(), pipes.stdin) {
            (Some(stdin), Some(rx)) => Some(tokio::spawn(forward_input(rx, stdin))),
            _ => None,
        };

        hook.started(pid, None);

        let status = child
            .wait()
            .await
            .map_err(|source| DriverError::Wait { pid, source })?;
        finish_io(forwarders, stdin_task).await;
        Ok(ExitStatus::from_std(status))
    }

    async fn run_tty(
        spec: &ProcessSpec,
        pipes: Pipes,
        hook: &dyn StartHook,
    ) -> Result<ExitStatus, DriverError> {
        let pty = nix::pty::openpty(None, None)
            .map_err(|e| DriverError::Terminal(std::io::Error::from(e)))?;
        nix::fcntl::fcntl(
            &pty.master,
            nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC),
        )
        .map_err(|e| DriverError::Terminal(std::io::Error::from(e)))?;

        let slave_out = pty.slave.try_clone().map_err(DriverError::Terminal)?;
        let slave_err = pty.slave.try_clone().map_err(DriverError::Terminal)?;

        let mut cmd = Self::command(spec);
        cmd.stdin(Stdio::from(pty.slave))
            .stdout(Stdio::from(slave_out))
            .stderr(Stdio::from(slave_err));

        // New session with the pty slave (already on fd 0) as controlling terminal.
        let setup_terminal = || -> std::io::Result<()> {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            if unsafe { libc::ioctl(0, libc::TIOCSCTTY as _, 0) } == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        };
        unsafe {
            cmd.pre_exec(setup_terminal);
        }

        let mut child = cmd.spawn().map_err(|source| DriverError::Spawn {
            entrypoint: spec.entrypoint.clone(),
            source,
        })?;
        // Close our copies of the slave so reads on the master end once the workload exits.
        drop(cmd);
        let pid = child.id().unwrap_or_default();

        let master = Arc::new(pty.master);
        let reader = master.try_clone().map_err(DriverError::Terminal)?;
        let reader = tokio::fs::File::from_std(std::fs::File::from(reader));
        let forwarders = vec![tokio::spawn(forward_output(reader, pipes.stdout))];

        let stdin_task = match pipes.stdin {
            Some(rx) => {
                let writer = master.try_clone().map_err(DriverError::Terminal)?;
                let writer = tokio::fs::File::from_std(std::fs::File::from(writer));
                Some(tokio::spawn(forward_input(rx, writer)))
            }
            None => None,
        };

        hook.started(pid, Some(Terminal { master }));

        let status = child
            .wait()
            .await
            .map_err(|source| DriverError::Wait { pid, source })?;
        finish_io(forwarders, stdin_task).await;
        Ok(ExitStatus::from_std(status))
    }
}

#[async_trait]
impl ExecDriver for ProcessDriver {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn run(
        &self,
        spec: &ProcessSpec,
        pipes: Pipes,
        hook: &dyn StartHook,
    ) -> Result<ExitStatus, DriverError> {
        if spec.tty {
            Self::run_tty(spec, pipes, hook).await
        } else {
            Self::run_piped(spec, pipes, hook).await
        }
    }
}

async fn forward_output<R: AsyncRead + Unpin>(mut reader: R, sink: OutputSink) {
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.write(Bytes::copy_from_slice(&buf[..n])),
            // EIO on a pty master means the slave side is gone.
            Err(_) => break,
        }
    }
}

async fn forward_input<W: AsyncWrite + Unpin>(mut rx: mpsc::Receiver<Bytes>, mut writer: W) {
    while let Some(chunk) = rx.recv().await {
        if writer.write_all(&chunk).await.is_err() || writer.flush().await.is_err() {
            break;
        }
    }
}

async fn finish_io(forwarders: Vec<JoinHandle<()>>, stdin_task: Option<JoinHandle<()>>) {
    if let Some(task) = stdin_task {
        task.abort();
    }
    for task in forwarders {
        if tokio::time::timeout(DRAIN_TIMEOUT, task).await.is_err() {
            log::warn!("output still open {DRAIN_TIMEOUT:?} after exit, detaching forwarder");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Streams;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordPid(Mutex<Vec<u32>>);

    impl StartHook for RecordPid {
        fn started(&self, pid: u32, _terminal: Option<Terminal>) {
            self.0.lock().push(pid);
        }
    }

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec {
            entrypoint: "/bin/sh".into(),
            arguments: vec!["-c".into(), script.into()],
            env: vec!["PATH=/usr/bin:/bin".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_exit_status_from_signal() {
        let status = std::process::ExitStatus::from_raw(9);
        let exit = ExitStatus::from_std(status);
        assert_eq!(exit.exit_code, 137);
        assert!(exit.signaled);
    }

    #[tokio::test]
    async fn test_run_reports_pid_and_exit_code() {
        let streams = Streams::new();
        let mut out = streams.subscribe_stdout();
        let hook = RecordPid::default();

        let exit = ProcessDriver::new()
            .run(&sh("echo hello; exit 3"), streams.pipes(false), &hook)
            .await
            .unwrap();

        assert_eq!(exit.exit_code, 3);
        assert_eq!(hook.0.lock().len(), 1);
        assert!(hook.0.lock()[0] > 0);
        assert_eq!(&out.recv().await.unwrap()[..], b"hello\n");
    }

    #[tokio::test]
    async fn test_missing_binary_never_starts() {
        let hook = RecordPid::default();
        let spec = ProcessSpec {
            entrypoint: "/nonexistent/definitely-not-here".into(),
            ..Default::default()
        };
        let err = ProcessDriver::new()
            .run(&spec, Streams::new().pipes(false), &hook)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 127);
        assert!(hook.0.lock().is_empty());
    }
}
