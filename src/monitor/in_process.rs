use std::sync::Arc;

use crate::container::RestartPolicy;
use crate::driver::{ExecDriver, ExitStatus, StartHook, Terminal};
use crate::error::Result;
use crate::status::{StartStatus, StatusStore, StopStatus};
use crate::stream::Streams;

use super::MonitorBase;

pub(super) struct InProcess {
    driver: Arc<dyn ExecDriver>,
    streams: Arc<Streams>,
}

impl InProcess {
    pub(super) fn new(driver: Arc<dyn ExecDriver>) -> Self {
        Self {
            driver,
            streams: Arc::new(Streams::new()),
        }
    }

    pub(super) fn start(&self, base: &Arc<MonitorBase>) -> Result<()> {
        let root = base.container.lock().root().to_path_buf();
        let store = StatusStore::new(root);
        // Recovery looks for the supervisor's pid; here that is the daemon.
        store.write_monitor_pid(std::process::id())?;
        tokio::spawn(supervise(
            Arc::clone(base),
            Arc::clone(&self.driver),
            Arc::clone(&self.streams),
            store,
        ));
        Ok(())
    }
}

struct Callback {
    base: Arc<MonitorBase>,
    store: StatusStore,
}

impl StartHook for Callback {
    fn started(&self, pid: u32, _terminal: Option<Terminal>) {
        self.base.callback(pid);
        if let Err(e) = self.store.write_start(&StartStatus::started(pid)) {
            log::warn!("failed to record start of pid {pid}: {e}");
        }
    }
}

/// Run the workload, restarting it per policy, until it exits for good.
async fn supervise(
    base: Arc<MonitorBase>,
    driver: Arc<dyn ExecDriver>,
    streams: Arc<Streams>,
    store: StatusStore,
) {
    let id = base.id();
    loop {
        let (spec, open_stdin) = {
            let container = base.container.lock();
            let mut spec = container.command.clone();
            spec.env = container.create_environment();
            (spec, container.config.open_stdin)
        };
        let hook = Callback {
            base: Arc::clone(&base),
            store: store.clone(),
        };

        let stop = match driver.run(&spec, streams.pipes(open_stdin), &hook).await {
            Ok(exit) => StopStatus { exit, error: None },
            Err(e) => {
                let message = e.to_string();
                log::error!("container {id} failed to start: {message}");
                if !base.start_signal.is_closed() {
                    if let Err(e) = store.write_start(&StartStatus::failed(message.clone())) {
                        log::warn!("failed to record start failure of {id}: {e}");
                    }
                    base.record_start_error(message.clone());
                    base.container.lock().state.set_errored(message.clone());
                    base.start_signal.close();
                }
                StopStatus {
                    exit: ExitStatus::from_code(e.exit_code()),
                    error: Some(message),
                }
            }
        };
        if let Err(e) = store.write_stop(&stop) {
            log::warn!("failed to record stop of {id}: {e}");
        }

        let restart = {
            let mut container = base.container.lock();
            container.state.set_stopped(&stop.exit, stop.error.clone());
            if let Err(e) = container.to_disk() {
                log::error!("Error dumping container {id} state to disk: {e}");
            }
            stop.error.is_none()
                && !base.stop_signal.is_closed()
                && base
                    .restart_policy
                    .should_restart(stop.exit.exit_code, container.state.restart_count)
        };
        log::info!("container {id} exited with code {}", stop.exit.exit_code);
        if !restart {
            break;
        }

        let count = base.container.lock().state.restart_count;
        let delay = RestartPolicy::backoff(count);
        log::info!("restarting container {id} in {delay:?}");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = base.stop_signal.wait() => {
                log::info!("restart of {id} cancelled");
                break;
            }
        }

        {
            let mut container = base.container.lock();
            container.state.restart_count += 1;
            container.state.set_starting();
            if let Err(e) = container.to_disk() {
                log::error!("Error dumping container {id} state to disk: {e}");
            }
        }
        if let Err(e) = store.reset() {
            log::warn!("failed to reset status of {id}: {e}");
        }
    }

    base.exited.close();
    if let Err(e) = base.close() {
        log::error!("failed to close monitor of {id}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Container, ContainerConfig, HostConfig, RestartPolicyName, RunState};
    use crate::driver::{DriverError, Pipes, ProcessSpec};
    use crate::ipalloc::FixedIpAllocator;
    use crate::monitor::ContainerMonitor;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Starts with pid 100 + run number and exits with `code`.
    struct CountingDriver {
        runs: AtomicU32,
        code: i32,
    }

    #[async_trait]
    impl ExecDriver for CountingDriver {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(
            &self,
            _spec: &ProcessSpec,
            _pipes: Pipes,
            hook: &dyn StartHook,
        ) -> std::result::Result<ExitStatus, DriverError> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            hook.started(100 + run, None);
            Ok(ExitStatus::from_code(self.code))
        }
    }

    fn container(root: &std::path::Path, policy: RestartPolicy) -> Arc<Mutex<Container>> {
        let host_config = HostConfig {
            restart_policy: policy,
            ..Default::default()
        };
        Arc::new(Mutex::new(Container::new(
            root,
            ContainerConfig::new("inproc"),
            host_config,
            ProcessSpec::default(),
        )))
    }

    #[tokio::test]
    async fn test_runs_once_and_records_status() {
        let dir = tempfile::tempdir().unwrap();
        let container = container(dir.path(), RestartPolicy::default());
        let driver = Arc::new(CountingDriver {
            runs: AtomicU32::new(0),
            code: 137,
        });
        let monitor = ContainerMonitor::in_process(
            container.clone(),
            RestartPolicy::default(),
            driver.clone(),
            Arc::new(FixedIpAllocator::new()),
        );
        monitor.start().unwrap();
        assert!(monitor.start_signal().wait_timeout(Duration::from_secs(2)).await);
        assert!(monitor.base.exited.wait_timeout(Duration::from_secs(2)).await);

        assert_eq!(driver.runs.load(Ordering::SeqCst), 1);
        assert_eq!(container.lock().state.status, RunState::Stopped);
        assert_eq!(container.lock().state.exit_code, Some(137));
        let store = StatusStore::new(dir.path());
        assert_eq!(store.load_start().unwrap(), Some(StartStatus::started(100)));
        assert_eq!(store.load_stop().unwrap().unwrap().exit.exit_code, 137);
        assert_eq!(store.monitor_pid(), Some(std::process::id() as i32));
    }

    #[tokio::test]
    async fn test_on_failure_restarts_up_to_limit() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RestartPolicy {
            name: RestartPolicyName::OnFailure,
            maximum_retry_count: 2,
        };
        let container = container(dir.path(), policy);
        let driver = Arc::new(CountingDriver {
            runs: AtomicU32::new(0),
            code: 1,
        });
        let monitor = ContainerMonitor::in_process(
            container.clone(),
            policy,
            driver.clone(),
            Arc::new(FixedIpAllocator::new()),
        );
        monitor.start().unwrap();
        assert!(monitor.base.exited.wait_timeout(Duration::from_secs(5)).await);

        assert_eq!(driver.runs.load(Ordering::SeqCst), 3);
        let state = container.lock().state.clone();
        assert_eq!(state.status, RunState::Stopped);
        assert_eq!(state.restart_count, 2);
    }

    #[tokio::test]
    async fn test_exit_on_next_suppresses_restart() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RestartPolicy {
            name: RestartPolicyName::Always,
            maximum_retry_count: 0,
        };
        let driver = Arc::new(CountingDriver {
            runs: AtomicU32::new(0),
            code: 0,
        });
        let monitor = ContainerMonitor::in_process(
            container(dir.path(), policy),
            policy,
            driver.clone(),
            Arc::new(FixedIpAllocator::new()),
        );
        monitor.exit_on_next();
        monitor.start().unwrap();
        assert!(monitor.base.exited.wait_timeout(Duration::from_secs(2)).await);
        assert_eq!(driver.runs.load(Ordering::SeqCst), 1);
    }
}
