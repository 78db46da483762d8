//! Rebuild container state from disk when the daemon starts.
//!
//! A stop record always wins. A start record means the Monitor Process is
//! presumed alive, unless its pid file says otherwise. With neither record the
//! container never finished a launch: a live Monitor Process may still report
//! its start, otherwise an interrupted `starting` is rolled back.

use std::path::Path;
use std::sync::Arc;

use nix::errno::Errno;
use nix::unistd::Pid;

use crate::container::{Container, RunState};
use crate::monitor::ContainerMonitor;
use crate::status::{Recorded, StatusStore};

use super::Daemon;

const MONITOR_GONE: &str = "monitor process exited without reporting a stop status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A stop record was applied.
    Stopped,
    /// A start record was applied; the Monitor Process still owns the workload.
    Running,
    /// The start failed, or the Monitor Process died without a stop record.
    Errored,
    /// No record, but the Monitor Process is alive and may still report.
    Pending,
    /// No record; the container was never launched.
    Fresh,
}

/// Apply the status store to `container`'s in-memory state.
pub fn reconcile(container: &mut Container, verify_liveness: bool) -> Outcome {
    let store = StatusStore::new(container.root());
    let recorded = store.recorded().unwrap_or_else(|e| {
        log::warn!("ignoring unreadable status of {}: {e}", container.id());
        Recorded::Nothing
    });
    match recorded {
        Recorded::Stopped(stop) => {
            container.state.set_stopped(&stop.exit, stop.error);
            Outcome::Stopped
        }
        Recorded::Started(start) => {
            if let Some(error) = start.error {
                container.state.set_errored(error);
                return Outcome::Errored;
            }
            if verify_liveness && monitor_alive(&store) == Some(false) {
                // It may have written its stop record after we first looked.
                if let Ok(Some(stop)) = store.load_stop() {
                    container.state.set_stopped(&stop.exit, stop.error);
                    return Outcome::Stopped;
                }
                log::warn!("monitor of {} is gone", container.id());
                container.state.set_errored(MONITOR_GONE);
                return Outcome::Errored;
            }
            let started_at = container.state.started_at;
            container.state.set_running(start.pid);
            if started_at.is_some() {
                container.state.started_at = started_at;
            }
            Outcome::Running
        }
        Recorded::Nothing => {
            if container.state.status != RunState::Starting {
                return Outcome::Fresh;
            }
            let alive = if verify_liveness {
                monitor_alive(&store) == Some(true)
            } else {
                store.monitor_pid().is_some()
            };
            if alive {
                return Outcome::Pending;
            }
            // The launch died with the previous daemon.
            log::info!("rolling back interrupted start of {}", container.id());
            container.state.status = if container.state.finished_at.is_some() {
                RunState::Stopped
            } else {
                RunState::Created
            };
            Outcome::Fresh
        }
    }
}

/// `None` when there is no usable pid file.
fn monitor_alive(store: &StatusStore) -> Option<bool> {
    let pid = store.monitor_pid()?;
    // An in-process monitor recorded the previous daemon's pid.
    if pid <= 0 || pid as u32 == std::process::id() {
        return Some(false);
    }
    match nix::sys::signal::kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => Some(true),
        Err(Errno::ESRCH) => Some(false),
        Err(e) => {
            log::debug!("liveness probe of pid {pid} failed: {e}");
            None
        }
    }
}

/// Load and reconcile every container under `root`. Unloadable containers
/// are logged and skipped.
pub fn scan(root: &Path, verify_liveness: bool) -> std::io::Result<Vec<(Container, Outcome)>> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e),
    };
    let mut found = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        match Container::from_disk(&path) {
            Ok(mut container) => {
                let outcome = reconcile(&mut container, verify_liveness);
                found.push((container, outcome));
            }
            Err(e) => log::warn!("skipping {}: {e}", path.display()),
        }
    }
    found.sort_by(|(a, _), (b, _)| a.config.created.cmp(&b.config.created));
    Ok(found)
}

impl Daemon {
    /// Register every container found on disk. Each is reconciled before it
    /// becomes visible, and no Monitor Process is spawned here.
    pub fn restore(&self) -> anyhow::Result<usize> {
        let found = scan(&self.config.root, self.config.verify_liveness)?;
        let mut restored = 0;
        for (mut container, outcome) in found {
            let id = container.id().to_string();
            match outcome {
                Outcome::Running | Outcome::Pending => {
                    if let Some(ip) = container.network.ip_address
                        && let Err(e) = self.ips.request(&id, Some(ip))
                    {
                        log::warn!("could not re-claim {ip} for {id}: {e}");
                    }
                }
                Outcome::Stopped | Outcome::Errored => container.network.ip_address = None,
                Outcome::Fresh => {}
            }
            if let Err(e) = container.to_disk() {
                log::error!("Error dumping container {id} state to disk: {e}");
            }

            let policy = container.host_config.restart_policy;
            let start_error = match container.state.status {
                RunState::Errored => container.state.error.clone(),
                _ => None,
            };
            let entry = match self.register(container) {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("skipping {id}: {e}");
                    continue;
                }
            };
            let monitor = match outcome {
                Outcome::Running | Outcome::Errored => Some(ContainerMonitor::adopted(
                    Arc::clone(&entry.container),
                    policy,
                    self.launch_config(),
                    Arc::clone(&self.ips),
                    start_error,
                )),
                Outcome::Pending => Some(ContainerMonitor::pending(
                    Arc::clone(&entry.container),
                    policy,
                    self.launch_config(),
                    Arc::clone(&self.ips),
                )),
                Outcome::Fresh => Some(self.new_monitor(Arc::clone(&entry.container), policy)),
                Outcome::Stopped => None,
            };
            *entry.monitor.lock() = monitor.map(Arc::new);
            log::info!("restored container {id}: {outcome:?}");
            restored += 1;
        }
        Ok(restored)
    }
}
