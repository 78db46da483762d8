use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use crate::config::{ENV_NOTIFY_ATTEMPTS, ENV_NOTIFY_DELAY_MS, ENV_RUN_DIR};
use crate::error::Result;
use crate::notify::RetryPolicy;
use crate::status::{Recorded, StatusStore};

use super::MonitorBase;
use super::process::MONITOR_COMMAND;

/// Monitor Process stdout/stderr, inside the container root.
pub const MONITOR_LOG_FILE: &str = "monitor.log";

/// What a Monitor Process needs to know beyond the container id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    pub containers_root: PathBuf,
    pub daemon_addr: String,
    pub run_dir: PathBuf,
    pub notify: RetryPolicy,
}

/// `[shepherd-monitor, <id>, <containers root>, <daemon addr>]`, in its own session
/// so it outlives the daemon.
pub fn monitor_command(id: &str, launch: &LaunchConfig) -> std::io::Result<tokio::process::Command> {
    let mut cmd = crate::reexec::command(MONITOR_COMMAND)?;
    cmd.arg(id)
        .arg(&launch.containers_root)
        .arg(&launch.daemon_addr)
        .env(ENV_NOTIFY_ATTEMPTS, launch.notify.attempts.to_string())
        .env(ENV_NOTIFY_DELAY_MS, launch.notify.delay.as_millis().to_string())
        .env(ENV_RUN_DIR, &launch.run_dir)
        .stdin(Stdio::null());
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }
    Ok(cmd)
}

pub(super) struct Detached {
    launch: LaunchConfig,
}

impl Detached {
    pub(super) fn new(launch: LaunchConfig) -> Self {
        Self { launch }
    }

    pub(super) fn start(&self, base: &Arc<MonitorBase>) -> Result<()> {
        let (id, root) = {
            let container = base.container.lock();
            (container.id().to_string(), container.root().to_path_buf())
        };

        let mut cmd = monitor_command(&id, &self.launch)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(root.join(MONITOR_LOG_FILE))?;
        cmd.stdout(Stdio::from(log.try_clone()?)).stderr(Stdio::from(log));

        let mut child = cmd.spawn()?;
        log::info!(
            "spawned monitor process {} for container {id}",
            child.id().unwrap_or_default()
        );

        let base = Arc::clone(base);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    log::debug!("monitor process for {id} exited cleanly")
                }
                Ok(status) => log::warn!("monitor process for {id} exited with {status}"),
                Err(e) => log::warn!("failed to wait for monitor process of {id}: {e}"),
            }
            settle_after_exit(&base, &StatusStore::new(&root));
        });
        Ok(())
    }
}

/// The Monitor Process is gone. If its stop never reached the daemon, apply
/// what the status store says and release anyone waiting on the start signal.
fn settle_after_exit(base: &MonitorBase, store: &StatusStore) {
    let id = base.id();
    let mut close = false;
    {
        let mut container = base.container.lock();
        if base.exited.is_closed() {
            base.start_signal.close();
            return;
        }
        let recorded = store.recorded().unwrap_or_else(|e| {
            log::warn!("unreadable status for {id}: {e}");
            Recorded::Nothing
        });
        match recorded {
            Recorded::Stopped(stop) => {
                log::warn!("stop notification for {id} was not delivered, applying recorded status");
                if let Ok(Some(start)) = store.load_start()
                    && let Some(error) = start.error
                {
                    base.record_start_error(error);
                }
                container.state.set_stopped(&stop.exit, stop.error);
                close = true;
            }
            Recorded::Started(start) => {
                let message = start
                    .error
                    .unwrap_or_else(|| "monitor process exited without reporting a stop status".into());
                container.state.set_errored(message.clone());
                base.record_start_error(message);
            }
            Recorded::Nothing => {
                let message = "monitor process exited before starting the container".to_string();
                container.state.set_errored(message.clone());
                base.record_start_error(message);
            }
        }
        if let Err(e) = container.to_disk() {
            log::error!("Error dumping container {id} state to disk: {e}");
        }
        base.exited.close();
    }
    base.start_signal.close();
    if close && let Err(e) = base.close() {
        log::error!("failed to close monitor of {id}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Container, ContainerConfig, HostConfig, RestartPolicy, RunState};
    use crate::driver::{ExitStatus, ProcessSpec};
    use crate::ipalloc::FixedIpAllocator;
    use crate::status::{StartStatus, StopStatus};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn base(root: &std::path::Path) -> MonitorBase {
        let container = Container::new(
            root,
            ContainerConfig::new("d1"),
            HostConfig::default(),
            ProcessSpec::default(),
        );
        MonitorBase::new(
            Arc::new(Mutex::new(container)),
            RestartPolicy::default(),
            Arc::new(FixedIpAllocator::new()),
        )
    }

    #[test]
    fn test_command_line() {
        let launch = LaunchConfig {
            containers_root: PathBuf::from("/var/lib/shepherd/containers"),
            daemon_addr: "127.0.0.1:4270".into(),
            run_dir: PathBuf::from("/run/shepherd"),
            notify: RetryPolicy {
                attempts: 2,
                delay: Duration::from_millis(50),
            },
        };
        let cmd = monitor_command("d1", &launch).unwrap();
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(args, ["d1", "/var/lib/shepherd/containers", "127.0.0.1:4270"]);
        let envs: Vec<_> = cmd.as_std().get_envs().collect();
        assert!(envs.contains(&(
            std::ffi::OsStr::new(ENV_NOTIFY_DELAY_MS),
            Some(std::ffi::OsStr::new("50"))
        )));
    }

    #[test]
    fn test_crash_before_start_marks_errored() {
        let dir = tempfile::tempdir().unwrap();
        let base = base(dir.path());
        settle_after_exit(&base, &StatusStore::new(dir.path()));

        assert!(base.start_signal.is_closed());
        assert_eq!(base.container.lock().state.status, RunState::Errored);
        assert!(base.start_error.lock().is_some());
    }

    #[test]
    fn test_undelivered_stop_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path());
        store.write_start(&StartStatus::started(55)).unwrap();
        store
            .write_stop(&StopStatus {
                exit: ExitStatus::from_code(3),
                error: None,
            })
            .unwrap();
        let base = base(dir.path());
        settle_after_exit(&base, &store);

        let container = base.container.lock();
        assert_eq!(container.state.status, RunState::Stopped);
        assert_eq!(container.state.exit_code, Some(3));
        assert!(base.start_error.lock().is_none());
    }

    #[test]
    fn test_delivered_stop_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let base = base(dir.path());
        base.container.lock().state.set_running(9);
        base.exited.close();
        settle_after_exit(&base, &StatusStore::new(dir.path()));
        assert_eq!(base.container.lock().state.status, RunState::Running);
    }
}
