//! Daemon-side monitor handle.
//!
//! A [`ContainerMonitor`] says how one container is supervised. It is either
//! in-process (the workload is a child of the daemon) or detached (a
//! re-executed Monitor Process owns the workload and reports back over the
//! notification channel). Callers only see the common operations.

pub mod bridge;
mod detached;
mod in_process;
pub mod process;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::container::{Container, RestartPolicy};
use crate::driver::ExecDriver;
use crate::error::Result;
use crate::gate::Gate;
use crate::ipalloc::FixedIpAllocator;

pub use detached::{LaunchConfig, MONITOR_LOG_FILE, monitor_command};

/// State shared by both monitor variants.
pub(crate) struct MonitorBase {
    container: Arc<Mutex<Container>>,
    ips: Arc<FixedIpAllocator>,
    restart_policy: RestartPolicy,
    /// Closed once the workload is runnable, or once it is known it never will be.
    start_signal: Gate,
    /// Closed by `exit_on_next`: the next natural exit must not restart.
    stop_signal: Gate,
    /// Closed once the end of the supervised run has been applied.
    exited: Gate,
    start_time: Mutex<Option<DateTime<Utc>>>,
    start_error: Mutex<Option<String>>,
}

impl MonitorBase {
    fn new(
        container: Arc<Mutex<Container>>,
        restart_policy: RestartPolicy,
        ips: Arc<FixedIpAllocator>,
    ) -> Self {
        Self {
            container,
            ips,
            restart_policy,
            start_signal: Gate::new(),
            stop_signal: Gate::new(),
            exited: Gate::new(),
            start_time: Mutex::new(None),
            start_error: Mutex::new(None),
        }
    }

    fn id(&self) -> String {
        self.container.lock().id().to_string()
    }

    /// The workload exists: mark it running and release start waiters.
    fn callback(&self, pid: u32) {
        {
            let mut container = self.container.lock();
            container.state.set_running(pid);
            if let Err(e) = container.to_disk() {
                log::debug!("{e}");
            }
        }
        self.start_signal.close();
    }

    fn record_start_error(&self, message: String) {
        *self.start_error.lock() = Some(message);
    }

    fn close(&self) -> Result<()> {
        let mut container = self.container.lock();
        container.cleanup(&self.ips);
        if let Err(e) = container.to_disk() {
            log::error!(
                "Error dumping container {} state to disk: {e}",
                container.id()
            );
            return Err(e);
        }
        Ok(())
    }
}

enum Variant {
    InProcess(in_process::InProcess),
    Detached(detached::Detached),
}

/// How a live container is supervised.
pub struct ContainerMonitor {
    base: Arc<MonitorBase>,
    variant: Variant,
}

impl ContainerMonitor {
    /// Supervise the workload as a direct child of this process.
    pub fn in_process(
        container: Arc<Mutex<Container>>,
        restart_policy: RestartPolicy,
        driver: Arc<dyn ExecDriver>,
        ips: Arc<FixedIpAllocator>,
    ) -> Self {
        Self {
            base: Arc::new(MonitorBase::new(container, restart_policy, ips)),
            variant: Variant::InProcess(in_process::InProcess::new(driver)),
        }
    }

    /// Supervise the workload through a re-executed Monitor Process.
    pub fn detached(
        container: Arc<Mutex<Container>>,
        restart_policy: RestartPolicy,
        launch: LaunchConfig,
        ips: Arc<FixedIpAllocator>,
    ) -> Self {
        Self {
            base: Arc::new(MonitorBase::new(container, restart_policy, ips)),
            variant: Variant::Detached(detached::Detached::new(launch)),
        }
    }

    /// Handle for a Monitor Process started by an earlier daemon instance.
    /// It counts as launched and its start signal is already closed.
    pub fn adopted(
        container: Arc<Mutex<Container>>,
        restart_policy: RestartPolicy,
        launch: LaunchConfig,
        ips: Arc<FixedIpAllocator>,
        start_error: Option<String>,
    ) -> Self {
        let monitor = Self::detached(container, restart_policy, launch, ips);
        let started_at = monitor.base.container.lock().state.started_at;
        *monitor.base.start_time.lock() = Some(started_at.unwrap_or_else(Utc::now));
        *monitor.base.start_error.lock() = start_error;
        monitor.base.start_signal.close();
        monitor
    }

    /// Handle for a Monitor Process that was launched by an earlier daemon
    /// instance but has not reported a start status yet. It counts as
    /// launched; its start signal closes on the next start notification.
    pub fn pending(
        container: Arc<Mutex<Container>>,
        restart_policy: RestartPolicy,
        launch: LaunchConfig,
        ips: Arc<FixedIpAllocator>,
    ) -> Self {
        let monitor = Self::detached(container, restart_policy, launch, ips);
        *monitor.base.start_time.lock() = Some(Utc::now());
        monitor
    }

    /// Begin supervision. Returns once the workload has been handed off, not
    /// once it is running; watch [`ContainerMonitor::start_signal`] for that.
    pub fn start(&self) -> Result<()> {
        *self.base.start_time.lock() = Some(Utc::now());
        match &self.variant {
            Variant::InProcess(m) => m.start(&self.base),
            Variant::Detached(m) => m.start(&self.base),
        }
    }

    /// Do not restart after the next natural exit.
    pub fn exit_on_next(&self) {
        self.base.stop_signal.close();
    }

    pub fn exit_requested(&self) -> bool {
        self.base.stop_signal.is_closed()
    }

    /// Release the container's external resources and persist its final state.
    /// Must not be called with the container lock held.
    pub fn close(&self) -> Result<()> {
        self.base.close()
    }

    pub fn start_signal(&self) -> Gate {
        self.base.start_signal.clone()
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        self.base.restart_policy
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        *self.base.start_time.lock()
    }

    pub fn has_launched(&self) -> bool {
        self.start_time().is_some()
    }

    pub fn start_error(&self) -> Option<String> {
        self.base.start_error.lock().clone()
    }

    pub fn record_start_error(&self, message: impl Into<String>) {
        self.base.record_start_error(message.into());
    }

    /// Note that the end of the run has been applied. Returns `false` if it already was.
    pub fn mark_exited(&self) -> bool {
        self.base.exited.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerConfig, HostConfig, RunState};
    use crate::driver::ProcessSpec;
    use std::net::IpAddr;
    use std::path::PathBuf;

    fn handle(root: &std::path::Path, ips: Arc<FixedIpAllocator>) -> ContainerMonitor {
        let container = Container::new(
            root,
            ContainerConfig::new("abc"),
            HostConfig::default(),
            ProcessSpec::default(),
        );
        let launch = LaunchConfig {
            containers_root: PathBuf::from("/nonexistent"),
            daemon_addr: "127.0.0.1:1".into(),
            run_dir: PathBuf::from("/nonexistent"),
            notify: Default::default(),
        };
        ContainerMonitor::detached(
            Arc::new(Mutex::new(container)),
            RestartPolicy::default(),
            launch,
            ips,
        )
    }

    #[test]
    fn test_duplicate_callback_is_safe() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = handle(dir.path(), Arc::new(FixedIpAllocator::new()));
        monitor.base.callback(10);
        monitor.base.callback(10);
        assert!(monitor.start_signal().is_closed());
        assert_eq!(monitor.base.container.lock().state.status, RunState::Running);
    }

    #[test]
    fn test_exit_on_next_twice() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = handle(dir.path(), Arc::new(FixedIpAllocator::new()));
        assert!(!monitor.exit_requested());
        monitor.exit_on_next();
        monitor.exit_on_next();
        assert!(monitor.exit_requested());
    }

    #[test]
    fn test_close_releases_ip_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let ips = Arc::new(FixedIpAllocator::new());
        let ip: IpAddr = "10.1.0.1".parse().unwrap();
        ips.register(&[ip]).unwrap();
        let monitor = handle(dir.path(), ips.clone());
        ips.request("abc", Some(ip)).unwrap();
        monitor.base.container.lock().network.ip_address = Some(ip);

        monitor.close().unwrap();
        assert_eq!(ips.snapshot()[&ip], None);
        let stored = Container::from_disk(dir.path()).unwrap();
        assert_eq!(stored.network.ip_address, None);
    }

    #[test]
    fn test_adopted_counts_as_started() {
        let dir = tempfile::tempdir().unwrap();
        let container = Arc::new(Mutex::new(Container::new(
            dir.path(),
            ContainerConfig::new("abc"),
            HostConfig::default(),
            ProcessSpec::default(),
        )));
        let monitor = ContainerMonitor::adopted(
            container,
            RestartPolicy::default(),
            LaunchConfig {
                containers_root: dir.path().to_path_buf(),
                daemon_addr: "127.0.0.1:1".into(),
                run_dir: dir.path().to_path_buf(),
                notify: Default::default(),
            },
            Arc::new(FixedIpAllocator::new()),
            Some("boom".into()),
        );
        assert!(monitor.has_launched());
        assert!(monitor.start_signal().is_closed());
        assert_eq!(monitor.start_error().as_deref(), Some("boom"));
    }
}
