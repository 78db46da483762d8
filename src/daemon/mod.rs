//! Daemon-side container registry and lifecycle.
//!
//! Lock order is container first, then its monitor slot. A monitor handle's
//! `close` takes the container lock itself and must be called with neither held.

pub mod handlers;
pub mod restore;
pub mod signals;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;

use crate::config::{DaemonConfig, MonitorMode};
use crate::container::{Container, ContainerConfig, HostConfig, RestartPolicy, RunState};
use crate::driver::{ExecDriver, ProcessSpec};
use crate::error::{Error, Result};
use crate::ipalloc::FixedIpAllocator;
use crate::monitor::{ContainerMonitor, LaunchConfig};
use crate::status::{StartStatus, StatusStore, StopStatus};

/// One registered container and the handle supervising it.
pub struct ContainerEntry {
    container: Arc<Mutex<Container>>,
    monitor: Mutex<Option<Arc<ContainerMonitor>>>,
}

impl ContainerEntry {
    fn new(container: Container) -> Self {
        Self {
            container: Arc::new(Mutex::new(container)),
            monitor: Mutex::new(None),
        }
    }

    pub fn container(&self) -> &Arc<Mutex<Container>> {
        &self.container
    }

    pub fn monitor(&self) -> Option<Arc<ContainerMonitor>> {
        self.monitor.lock().clone()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateOptions {
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub command: ProcessSpec,
    pub host_config: HostConfig,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
}

pub struct Daemon {
    config: DaemonConfig,
    containers: RwLock<HashMap<String, Arc<ContainerEntry>>>,
    ips: Arc<FixedIpAllocator>,
    driver: Arc<dyn ExecDriver>,
}

impl Daemon {
    pub fn new(config: DaemonConfig, driver: Arc<dyn ExecDriver>) -> Result<Arc<Self>> {
        let ips = Arc::new(FixedIpAllocator::new());
        ips.register(&config.fixed_ips)?;
        log::info!(
            "daemon using {} driver, {:?} monitors, root {}",
            driver.name(),
            config.monitor_mode,
            config.root.display()
        );
        Ok(Arc::new(Self {
            config,
            containers: RwLock::new(HashMap::new()),
            ips,
            driver,
        }))
    }

    pub fn ips(&self) -> &Arc<FixedIpAllocator> {
        &self.ips
    }

    pub fn launch_config(&self) -> LaunchConfig {
        LaunchConfig {
            containers_root: self.config.root.clone(),
            daemon_addr: self.config.listen.clone(),
            run_dir: self.config.run_dir.clone(),
            notify: self.config.notify.retry_policy(),
        }
    }

    pub fn get(&self, id: &str) -> Result<Arc<ContainerEntry>> {
        self.containers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Snapshot of every registered container.
    pub fn list(&self) -> Vec<Container> {
        let entries: Vec<_> = self.containers.read().values().cloned().collect();
        let mut containers: Vec<Container> =
            entries.iter().map(|e| e.container.lock().clone()).collect();
        containers.sort_by(|a, b| a.config.created.cmp(&b.config.created));
        containers
    }

    /// Persist a new container under `root/<id>` and register it.
    pub fn create_container(&self, options: CreateOptions) -> Result<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let root = self.config.root.join(&id);
        std::fs::create_dir_all(&root)?;

        let mut config = ContainerConfig::new(&id);
        config.name = options.name;
        config.hostname = options.hostname;
        config.attach_stdin = options.attach_stdin;
        config.attach_stdout = options.attach_stdout;
        config.attach_stderr = options.attach_stderr;
        config.tty = options.command.tty;
        config.open_stdin = options.command.open_stdin;

        let container = Container::new(root, config, options.host_config, options.command);
        container.to_disk()?;
        self.register(container)?;
        log::info!("created container {id}");
        Ok(id)
    }

    /// Add an already-loaded container. Only complete, reconciled containers belong here.
    pub fn register(&self, container: Container) -> Result<Arc<ContainerEntry>> {
        let id = container.id().to_string();
        let mut containers = self.containers.write();
        if containers.contains_key(&id) {
            return Err(Error::AlreadyExists(id));
        }
        let entry = Arc::new(ContainerEntry::new(container));
        containers.insert(id, Arc::clone(&entry));
        Ok(entry)
    }

    fn new_monitor(
        &self,
        container: Arc<Mutex<Container>>,
        restart_policy: RestartPolicy,
    ) -> ContainerMonitor {
        match self.config.monitor_mode {
            MonitorMode::Detached => ContainerMonitor::detached(
                container,
                restart_policy,
                self.launch_config(),
                Arc::clone(&self.ips),
            ),
            MonitorMode::InProcess => ContainerMonitor::in_process(
                container,
                restart_policy,
                Arc::clone(&self.driver),
                Arc::clone(&self.ips),
            ),
        }
    }

    /// Hand the container to a monitor. Readiness is observed through
    /// [`Daemon::wait_started`].
    pub fn start_container(&self, id: &str) -> Result<()> {
        let entry = self.get(id)?;
        let monitor = {
            let mut container = entry.container.lock();
            match container.state.status {
                RunState::Paused => return Err(Error::Paused),
                RunState::Running | RunState::Starting => return Err(Error::AlreadyStarted),
                _ => {}
            }
            StatusStore::new(container.root()).reset()?;
            if container.host_config.wants_fixed_ip() {
                // A policy restart still holds its address; ask for that one again.
                let wanted = container.host_config.fixed_ip.or(container.network.ip_address);
                let ip = self.ips.request(id, wanted)?;
                container.network.ip_address = Some(ip);
            }
            container.state.set_starting();
            container.to_disk()?;

            let mut slot = entry.monitor.lock();
            match slot.as_ref() {
                Some(monitor) if !monitor.has_launched() => Arc::clone(monitor),
                _ => {
                    let policy = container.host_config.restart_policy;
                    let monitor =
                        Arc::new(self.new_monitor(Arc::clone(&entry.container), policy));
                    *slot = Some(Arc::clone(&monitor));
                    monitor
                }
            }
        };

        if let Err(e) = monitor.start() {
            log::error!("failed to start monitor for {id}: {e}");
            monitor.record_start_error(e.to_string());
            {
                let mut container = entry.container.lock();
                container.state.set_errored(e.to_string());
                if let Err(e) = container.to_disk() {
                    log::error!("Error dumping container {id} state to disk: {e}");
                }
            }
            monitor.start_signal().close();
            if let Err(close_err) = monitor.close() {
                log::error!("failed to close monitor of {id}: {close_err}");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Block until the container's start signal closes; `None` waits forever.
    pub async fn wait_started(&self, id: &str, timeout: Option<Duration>) -> Result<()> {
        let monitor = self
            .get(id)?
            .monitor()
            .ok_or_else(|| Error::NotRunning(id.to_string()))?;
        let gate = monitor.start_signal();
        match timeout {
            Some(timeout) => {
                if !gate.wait_timeout(timeout).await {
                    return Err(Error::StartFailed {
                        id: id.to_string(),
                        message: format!("not started after {timeout:?}"),
                    });
                }
            }
            None => gate.wait().await,
        }
        match monitor.start_error() {
            Some(message) => Err(Error::StartFailed {
                id: id.to_string(),
                message,
            }),
            None => Ok(()),
        }
    }

    /// Stop without restarting: mark exit-on-next, then signal the workload.
    /// A container that is not running only has its pending restart cancelled.
    pub fn stop_container(&self, id: &str, signal: Signal) -> Result<()> {
        let entry = self.get(id)?;
        if let Some(monitor) = entry.monitor() {
            monitor.exit_on_next();
        }
        let pid = {
            let container = entry.container.lock();
            if container.state.is_running() {
                container.state.pid
            } else {
                None
            }
        };
        if let Some(pid) = pid {
            log::info!("sending {signal} to container {id} (pid {pid})");
            nix::sys::signal::kill(Pid::from_raw(pid as i32), signal)?;
        }
        Ok(())
    }

    /// Apply a start notification from a Monitor Process.
    pub fn container_monitor_start(&self, id: &str, status: StartStatus) -> Result<()> {
        log::info!("container monitor start {id}: {status:?}");
        let entry = self.get(id)?;
        let monitor = entry.monitor();
        {
            let mut container = entry.container.lock();
            match container.state.status {
                RunState::Paused => return Err(Error::Paused),
                RunState::Running | RunState::Errored => return Err(Error::AlreadyStarted),
                RunState::Stopped => return Err(Error::AlreadyStopped),
                RunState::Created | RunState::Starting => {}
            }
            match &status.error {
                Some(error) => {
                    container.state.set_errored(error.clone());
                    if let Some(monitor) = &monitor {
                        monitor.record_start_error(error.clone());
                    }
                }
                None => container.state.set_running(status.pid),
            }
            if let Err(e) = container.to_disk() {
                log::warn!("Error dumping container {id} state to disk: {e}");
            }
        }
        if let Some(monitor) = monitor {
            monitor.start_signal().close();
        }
        Ok(())
    }

    /// Apply a stop notification, then restart per policy or release the container.
    pub fn container_monitor_stop(self: &Arc<Self>, id: &str, status: StopStatus) -> Result<()> {
        log::info!("container monitor stop {id}: {status:?}");
        let entry = self.get(id)?;
        let monitor = entry.monitor();
        let restart = {
            let mut container = entry.container.lock();
            if container.state.status == RunState::Stopped {
                return Err(Error::AlreadyStopped);
            }
            container.state.set_stopped(&status.exit, status.error.clone());
            let restart = monitor.as_ref().is_some_and(|m| {
                status.error.is_none()
                    && !m.exit_requested()
                    && m.restart_policy()
                        .should_restart(status.exit.exit_code, container.state.restart_count)
            });
            if restart {
                container.state.restart_count += 1;
            }
            if let Err(e) = container.to_disk() {
                log::warn!("Error dumping container {id} state to disk: {e}");
            }
            if let Some(monitor) = &monitor {
                monitor.mark_exited();
            }
            restart.then_some(container.state.restart_count)
        };

        let Some(monitor) = monitor else {
            return Ok(());
        };
        monitor.start_signal().close();
        match restart {
            Some(count) => self.schedule_restart(id, count, monitor),
            None => {
                if let Err(e) = monitor.close() {
                    log::error!("failed to close monitor of {id}: {e}");
                }
            }
        }
        Ok(())
    }

    fn schedule_restart(self: &Arc<Self>, id: &str, count: u32, previous: Arc<ContainerMonitor>) {
        let delay = RestartPolicy::backoff(count.saturating_sub(1));
        log::info!("restarting container {id} in {delay:?} (restart #{count})");
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::warn!("no runtime available to restart container {id}");
            return;
        };
        let daemon = Arc::clone(self);
        let id = id.to_string();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if previous.exit_requested() {
                log::info!("restart of {id} cancelled");
                if let Err(e) = previous.close() {
                    log::error!("failed to close monitor of {id}: {e}");
                }
                return;
            }
            if let Err(e) = daemon.start_container(&id) {
                log::error!("failed to restart container {id}: {e}");
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::driver::ExitStatus;
    use crate::monitor::process::testing::ScriptedDriver;

    /// A daemon under `root` whose in-process driver starts pid 4242 and exits 0.
    pub(crate) fn test_daemon(root: &std::path::Path, mode: MonitorMode) -> Arc<Daemon> {
        test_daemon_with_ips(root, mode, &["10.9.0.1"])
    }

    pub(crate) fn test_daemon_with_ips(
        root: &std::path::Path,
        mode: MonitorMode,
        ips: &[&str],
    ) -> Arc<Daemon> {
        let config = DaemonConfig {
            root: root.join("containers"),
            run_dir: root.join("run"),
            monitor_mode: mode,
            fixed_ips: ips.iter().map(|ip| ip.parse().unwrap()).collect(),
            ..Default::default()
        };
        let driver = Arc::new(ScriptedDriver {
            pid: 4242,
            output: b"",
            outcome: || Ok(ExitStatus::from_code(0)),
        });
        Daemon::new(config, driver).unwrap()
    }
}
