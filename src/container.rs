//! Container model and its on-disk representation.
//!
//! Every container owns a root directory holding `config.json` (identity,
//! stdio flags and last persisted state), `hostconfig.json` (restart policy,
//! fixed IP request) and `command.json` (the process to run). The daemon and
//! the Monitor Process each load their own copy from these files.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::driver::{ExitStatus, ProcessSpec};
use crate::error::{Error, Result};
use crate::ipalloc::FixedIpAllocator;
use crate::status;

pub const CONFIG_FILE: &str = "config.json";
pub const HOST_CONFIG_FILE: &str = "hostconfig.json";
pub const COMMAND_FILE: &str = "command.json";

const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(60);

const DEFAULT_PATH_ENV: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Created,
    Starting,
    Running,
    Paused,
    Stopped,
    Errored,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Created => "created",
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Stopped => "stopped",
            RunState::Errored => "errored",
        };
        f.pad(s)
    }
}

/// Mutable run state. Transitions are applied under the container lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub status: RunState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub oom_killed: bool,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restart_count: u32,
}

impl State {
    /// Running or paused: a workload process exists.
    pub fn is_running(&self) -> bool {
        matches!(self.status, RunState::Running | RunState::Paused)
    }

    pub fn set_starting(&mut self) {
        self.status = RunState::Starting;
        self.pid = None;
        self.exit_code = None;
        self.oom_killed = false;
        self.error = None;
    }

    pub fn set_running(&mut self, pid: u32) {
        self.status = RunState::Running;
        self.pid = Some(pid);
        self.exit_code = None;
        self.oom_killed = false;
        self.error = None;
        self.started_at = Some(Utc::now());
    }

    pub fn set_stopped(&mut self, exit: &ExitStatus, error: Option<String>) {
        self.status = RunState::Stopped;
        self.pid = None;
        self.exit_code = Some(exit.exit_code);
        self.oom_killed = exit.oom_killed;
        // Keep an earlier start error if the stop carries none.
        if error.is_some() {
            self.error = error;
        }
        self.finished_at = Some(Utc::now());
    }

    pub fn set_errored(&mut self, message: impl Into<String>) {
        self.status = RunState::Errored;
        self.pid = None;
        self.error = Some(message.into());
    }

    pub fn set_paused(&mut self) {
        if self.status == RunState::Running {
            self.status = RunState::Paused;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicyName {
    #[default]
    Never,
    Always,
    OnFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RestartPolicy {
    #[serde(default)]
    pub name: RestartPolicyName,
    /// Only meaningful for `on-failure`; 0 means unbounded.
    #[serde(default)]
    pub maximum_retry_count: u32,
}

impl RestartPolicy {
    pub fn should_restart(&self, exit_code: i32, restart_count: u32) -> bool {
        match self.name {
            RestartPolicyName::Never => false,
            RestartPolicyName::Always => true,
            RestartPolicyName::OnFailure => {
                exit_code != 0
                    && (self.maximum_retry_count == 0 || restart_count < self.maximum_retry_count)
            }
        }
    }

    /// Delay before restart number `restart_count`: 100ms doubling, capped at a minute.
    pub fn backoff(restart_count: u32) -> Duration {
        let millis = 100u64.saturating_mul(1u64 << restart_count.min(16));
        Duration::from_millis(millis).min(MAX_RESTART_BACKOFF)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Request an address from the fixed IP pool. `Some(ip)` asks for that
    /// exact address, `any_fixed_ip` asks for whichever is free.
    #[serde(default)]
    pub fixed_ip: Option<IpAddr>,
    #[serde(default)]
    pub any_fixed_ip: bool,
}

impl HostConfig {
    pub fn wants_fixed_ip(&self) -> bool {
        self.fixed_ip.is_some() || self.any_fixed_ip
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub ip_address: Option<IpAddr>,
}

/// Identity and stdio configuration, persisted in `config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub attach_stdin: bool,
    #[serde(default)]
    pub attach_stdout: bool,
    #[serde(default)]
    pub attach_stderr: bool,
    #[serde(default)]
    pub open_stdin: bool,
    #[serde(default)]
    pub tty: bool,
}

impl ContainerConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            created: Utc::now(),
            hostname: None,
            attach_stdin: false,
            attach_stdout: false,
            attach_stderr: false,
            open_stdin: false,
            tty: false,
        }
    }

    /// Created in "attach before start" mode: output is held until a client attaches.
    pub fn attach_before_start(&self) -> bool {
        self.attach_stdin || self.attach_stdout || self.attach_stderr
    }
}

#[derive(Serialize)]
struct StoredRef<'a> {
    #[serde(flatten)]
    config: &'a ContainerConfig,
    state: &'a State,
    network: &'a NetworkSettings,
}

#[derive(Deserialize)]
struct Stored {
    #[serde(flatten)]
    config: ContainerConfig,
    #[serde(default)]
    state: State,
    #[serde(default)]
    network: NetworkSettings,
}

#[derive(Debug, Clone)]
pub struct Container {
    root: PathBuf,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    pub command: ProcessSpec,
    pub state: State,
    pub network: NetworkSettings,
}

impl Container {
    pub fn new(
        root: impl Into<PathBuf>,
        config: ContainerConfig,
        host_config: HostConfig,
        command: ProcessSpec,
    ) -> Self {
        Self {
            root: root.into(),
            config,
            host_config,
            command,
            state: State::default(),
            network: NetworkSettings::default(),
        }
    }

    /// Load all three persisted files. Each missing or malformed file is
    /// reported with its own path.
    pub fn from_disk(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let stored: Stored = read_json(&root.join(CONFIG_FILE))?;
        let host_config = read_host_config(&root)?;
        let command = read_command(&root)?;
        Ok(Self {
            root,
            config: stored.config,
            host_config,
            command,
            state: stored.state,
            network: stored.network,
        })
    }

    pub fn to_disk(&self) -> Result<()> {
        let stored = StoredRef {
            config: &self.config,
            state: &self.state,
            network: &self.network,
        };
        status::write_atomic(&self.root, CONFIG_FILE, &serde_json::to_vec_pretty(&stored)?, true)?;
        status::write_atomic(
            &self.root,
            HOST_CONFIG_FILE,
            &serde_json::to_vec_pretty(&self.host_config)?,
            true,
        )?;
        status::write_atomic(&self.root, COMMAND_FILE, &serde_json::to_vec_pretty(&self.command)?, true)?;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Environment for the workload: defaults first, user entries override by key.
    pub fn create_environment(&self) -> Vec<String> {
        let mut env = vec![DEFAULT_PATH_ENV.to_string()];
        let hostname = self
            .config
            .hostname
            .clone()
            .unwrap_or_else(|| self.config.id.chars().take(12).collect());
        env.push(format!("HOSTNAME={hostname}"));
        if self.command.tty {
            env.push("TERM=xterm".to_string());
        }
        for entry in &self.command.env {
            let key = entry.split('=').next().unwrap_or(entry);
            env.retain(|existing| existing.split('=').next() != Some(key));
            env.push(entry.clone());
        }
        env
    }

    /// Release external resources held for the container.
    pub fn cleanup(&mut self, ips: &FixedIpAllocator) {
        if let Some(ip) = self.network.ip_address.take() {
            ips.release(ip);
        }
    }
}

pub fn read_host_config(root: &Path) -> Result<HostConfig> {
    read_json(&root.join(HOST_CONFIG_FILE))
}

pub fn read_command(root: &Path) -> Result<ProcessSpec> {
    read_json(&root.join(COMMAND_FILE))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read(path).map_err(|e| Error::Config {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    serde_json::from_slice(&data).map_err(|e| Error::Config {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(root: &Path) -> Container {
        let mut config = ContainerConfig::new("c0ffee");
        config.tty = true;
        let command = ProcessSpec {
            entrypoint: "/bin/sh".into(),
            arguments: vec!["-c".into(), "true".into()],
            env: vec!["PATH=/opt/bin".into(), "FOO=bar".into()],
            working_dir: None,
            tty: true,
            open_stdin: false,
        };
        Container::new(root, config, HostConfig::default(), command)
    }

    #[test]
    fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut container = sample(dir.path());
        container.state.set_running(77);
        container.to_disk().unwrap();

        let loaded = Container::from_disk(dir.path()).unwrap();
        assert_eq!(loaded.config, container.config);
        assert_eq!(loaded.command, container.command);
        assert_eq!(loaded.state.status, RunState::Running);
        assert_eq!(loaded.state.pid, Some(77));
    }

    #[test]
    fn test_missing_command_is_reported_by_path() {
        let dir = tempfile::tempdir().unwrap();
        sample(dir.path()).to_disk().unwrap();
        std::fs::remove_file(dir.path().join(COMMAND_FILE)).unwrap();

        match Container::from_disk(dir.path()) {
            Err(Error::Config { path, .. }) => assert!(path.ends_with(COMMAND_FILE)),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_environment_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let env = sample(dir.path()).create_environment();
        assert!(env.contains(&"PATH=/opt/bin".to_string()));
        assert!(!env.iter().any(|e| e == DEFAULT_PATH_ENV));
        assert!(env.contains(&"TERM=xterm".to_string()));
        assert!(env.contains(&"HOSTNAME=c0ffee".to_string()));
        assert!(env.contains(&"FOO=bar".to_string()));
    }

    #[test]
    fn test_restart_policy() {
        let never = RestartPolicy::default();
        assert!(!never.should_restart(1, 0));

        let always = RestartPolicy {
            name: RestartPolicyName::Always,
            maximum_retry_count: 0,
        };
        assert!(always.should_restart(0, 10));

        let on_failure = RestartPolicy {
            name: RestartPolicyName::OnFailure,
            maximum_retry_count: 2,
        };
        assert!(!on_failure.should_restart(0, 0));
        assert!(on_failure.should_restart(137, 1));
        assert!(!on_failure.should_restart(137, 2));

        assert_eq!(RestartPolicy::backoff(0), Duration::from_millis(100));
        assert_eq!(RestartPolicy::backoff(3), Duration::from_millis(800));
        assert_eq!(RestartPolicy::backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn test_stop_keeps_start_error() {
        let mut state = State::default();
        state.set_errored("exec format error");
        state.set_stopped(&ExitStatus::from_code(126), None);
        assert_eq!(state.status, RunState::Stopped);
        assert_eq!(state.exit_code, Some(126));
        assert_eq!(state.error.as_deref(), Some("exec format error"));
    }

    #[test]
    fn test_restart_policy_serde_names() {
        let policy: RestartPolicy =
            serde_json::from_str(r#"{"name":"on-failure","maximum_retry_count":3}"#).unwrap();
        assert_eq!(policy.name, RestartPolicyName::OnFailure);
        assert_eq!(policy.maximum_retry_count, 3);
    }
}
