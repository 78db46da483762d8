//! The Monitor Process: re-executed from the daemon binary, it owns one
//! container's workload for the whole run.
//!
//! Startup order matters. `monitor.pid` goes down first, then the container
//! files are loaded; any failure up to that point is fatal and leaves no
//! status behind. After the workload exits the stop status is persisted and
//! delivered, and the process exits.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::MonitorEnv;
use crate::container::{Container, RestartPolicy, RunState};
use crate::driver::{ExecDriver, ExitStatus, ProcessDriver, StartHook, Terminal};
use crate::gate::Gate;
use crate::notify::{Notifier, Reporter};
use crate::status::{StartStatus, StatusStore, StopStatus};
use crate::stream::Streams;

use super::bridge;

/// `argv[0]` the daemon re-executes itself under.
pub const MONITOR_COMMAND: &str = "shepherd-monitor";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorArgs {
    pub id: String,
    pub containers_root: PathBuf,
    pub daemon_addr: String,
}

impl MonitorArgs {
    /// Parse a full argument vector, `argv[0]` included.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Result<Self> {
        let mut args = args.into_iter().skip(1);
        let (Some(id), Some(root), Some(daemon_addr)) = (args.next(), args.next(), args.next())
        else {
            bail!("usage: {MONITOR_COMMAND} <container-id> <containers-root> <daemon-address>");
        };
        if id.is_empty() || id.contains('/') {
            bail!("invalid container id {id:?}");
        }
        Ok(Self {
            id,
            containers_root: PathBuf::from(root),
            daemon_addr,
        })
    }

    pub fn container_root(&self) -> PathBuf {
        self.containers_root.join(&self.id)
    }
}

/// Entry point registered under [`MONITOR_COMMAND`]. Never returns.
pub fn main() {
    let args = match MonitorArgs::from_args(std::env::args()) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("FATAL: {e:#}");
            std::process::exit(2);
        }
    };
    let short_id: String = args.id.chars().take(12).collect();
    crate::logging::init(&format!("monitor {short_id}"));

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("Failed to create Tokio runtime: {e}");
            std::process::exit(1);
        }
    };
    let code = match rt.block_on(run(args, MonitorEnv::from_env())) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(args: MonitorArgs, env: MonitorEnv) -> Result<i32> {
    let monitor = MonitorProcess::init(&args, &env)?;

    let socket = env.run_dir.join(format!("{}.sock", args.id));
    let control = monitor.control();
    let server = {
        let socket = socket.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge::serve(control, &socket).await {
                log::error!("control socket: {e:#}");
            }
        })
    };

    let code = monitor.start(&ProcessDriver::new()).await;

    server.abort();
    if let Err(e) = std::fs::remove_file(&socket)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        log::warn!("failed to remove {}: {e}", socket.display());
    }
    log::info!("monitor for {} shutting down", args.id);
    Ok(code)
}

/// State the workload run and the control socket share.
pub struct MonitorControl {
    id: String,
    tty: bool,
    open_stdin: bool,
    attach_before_start: bool,
    container: Mutex<Container>,
    restart_policy: RestartPolicy,
    start_signal: Gate,
    wait_attach: Gate,
    exited: Gate,
    streams: Streams,
    terminal: Mutex<Option<Terminal>>,
    reporter: Reporter,
    start_report: Mutex<Option<JoinHandle<()>>>,
    start_time: Mutex<Option<DateTime<Utc>>>,
}

impl MonitorControl {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tty(&self) -> bool {
        self.tty
    }

    pub fn streams(&self) -> &Streams {
        &self.streams
    }

    pub fn status(&self) -> RunState {
        self.container.lock().state.status
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        self.restart_policy
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        *self.start_time.lock()
    }

    pub fn start_signal(&self) -> Gate {
        self.start_signal.clone()
    }

    /// Closed once the workload has exited.
    pub fn exited(&self) -> Gate {
        self.exited.clone()
    }

    pub fn terminal(&self) -> Option<Terminal> {
        self.terminal.lock().clone()
    }

    /// A client attached; lets a deferred start proceed. Only the first call has an effect.
    pub fn release_attach(&self) -> bool {
        let released = self.wait_attach.close();
        if released && self.attach_before_start {
            log::info!("client attached, starting container");
        }
        released
    }
}

/// Fires once the workload exists.
struct StartCallback {
    control: Arc<MonitorControl>,
}

impl StartHook for StartCallback {
    fn started(&self, pid: u32, terminal: Option<Terminal>) {
        let control = &self.control;
        if !control.start_signal.close() {
            log::debug!("ignoring repeated start callback for pid {pid}");
            return;
        }
        {
            let mut container = control.container.lock();
            container.state.set_running(pid);
            if let Err(e) = container.to_disk() {
                log::debug!("{e}");
            }
        }
        *control.terminal.lock() = terminal;
        log::info!("container {} started with pid {pid}", control.id);

        let status = StartStatus::started(pid);
        if let Err(e) = control.reporter.record_start(&status) {
            log::error!("failed to persist start status: {e}");
        }
        let sender = Arc::clone(control);
        let task = tokio::spawn(async move {
            if let Err(e) = sender.reporter.send_start(&status).await {
                log::warn!("failed to notify daemon of start: {e}");
            }
        });
        *control.start_report.lock() = Some(task);
    }
}

pub struct MonitorProcess {
    control: Arc<MonitorControl>,
    command: crate::driver::ProcessSpec,
}

impl MonitorProcess {
    /// Load everything needed to run the container. Errors here are fatal.
    pub fn init(args: &MonitorArgs, env: &MonitorEnv) -> Result<Self> {
        let root = args.container_root();
        let store = StatusStore::new(&root);
        store
            .write_monitor_pid(std::process::id())
            .context("Error dump pid")?;

        let mut container = Container::from_disk(&root).context("Error load config")?;
        if container.id() != args.id {
            bail!(
                "container at {} has id {}, expected {}",
                root.display(),
                container.id(),
                args.id
            );
        }
        let mut command = container.command.clone();
        command.env = container.create_environment();
        command.tty = command.tty || container.config.tty;
        command.open_stdin = command.open_stdin || container.config.open_stdin;
        container.command = command.clone();

        let streams = Streams::with_log(&root).context("start logging failed")?;
        let notifier =
            Notifier::new(&args.daemon_addr, env.notify).context("Error build notifier")?;
        let reporter = Reporter::new(args.id.clone(), store, notifier);

        let control = MonitorControl {
            id: args.id.clone(),
            tty: command.tty,
            open_stdin: command.open_stdin,
            attach_before_start: container.config.attach_before_start(),
            restart_policy: container.host_config.restart_policy,
            container: Mutex::new(container),
            start_signal: Gate::new(),
            wait_attach: Gate::new(),
            exited: Gate::new(),
            streams,
            terminal: Mutex::new(None),
            reporter,
            start_report: Mutex::new(None),
            start_time: Mutex::new(None),
        };
        Ok(Self {
            control: Arc::new(control),
            command,
        })
    }

    pub fn control(&self) -> Arc<MonitorControl> {
        Arc::clone(&self.control)
    }

    /// Run the workload to completion and report it. Returns the process exit code.
    pub async fn start(&self, driver: &dyn ExecDriver) -> i32 {
        let control = &self.control;
        if control.attach_before_start {
            log::info!("waiting for a client to attach before starting");
            control.wait_attach.wait().await;
        }

        let pipes = control.streams.pipes(control.open_stdin);
        *control.start_time.lock() = Some(Utc::now());
        let hook = StartCallback {
            control: Arc::clone(control),
        };
        let result = driver.run(&self.command, pipes, &hook).await;

        // The start report goes out before anything about the stop.
        let pending = control.start_report.lock().take();
        if let Some(task) = pending
            && let Err(e) = task.await
        {
            log::warn!("start report task failed: {e}");
        }

        let (stop, code) = match result {
            Ok(exit) => (StopStatus { exit, error: None }, 0),
            Err(e) => {
                let message = e.to_string();
                log::error!("start container err {message}");
                if control.start_signal.close() {
                    let failed = StartStatus::failed(message.clone());
                    if let Err(e) = control.reporter.report_start(&failed).await {
                        log::warn!("failed to report start failure: {e}");
                    }
                }
                let stop = StopStatus {
                    exit: ExitStatus::from_code(e.exit_code()),
                    error: Some(message),
                };
                (stop, 1)
            }
        };

        control.exited.close();
        *control.terminal.lock() = None;
        {
            let mut container = control.container.lock();
            container.state.set_stopped(&stop.exit, stop.error.clone());
            if let Err(e) = container.to_disk() {
                log::debug!("{e}");
            }
        }
        let ran = control
            .start_time()
            .map(|t| (Utc::now() - t).num_milliseconds())
            .unwrap_or_default();
        log::info!(
            "container {} exited with code {} after {ran}ms (restart policy {:?})",
            control.id,
            stop.exit.exit_code,
            control.restart_policy().name
        );
        if let Err(e) = control.reporter.report_stop(&stop).await {
            log::warn!("failed to notify daemon of stop: {e}");
        }
        code
    }
}
