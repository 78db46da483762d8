use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::notify::RetryPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/shepherd/shepherd.toml";

/// Environment handed from the daemon to every Monitor Process it spawns.
pub const ENV_NOTIFY_ATTEMPTS: &str = "SHEPHERD_NOTIFY_ATTEMPTS";
pub const ENV_NOTIFY_DELAY_MS: &str = "SHEPHERD_NOTIFY_DELAY_MS";
pub const ENV_RUN_DIR: &str = "SHEPHERD_RUN_DIR";

/// Top‑level daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Base directory; each container lives in `root/<id>`.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Where Monitor Processes bind their control sockets.
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
    /// Notification endpoint the daemon listens on (host:port).
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub monitor_mode: MonitorMode,
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Probe `monitor.pid` before trusting a start record during restore.
    #[serde(default = "default_true")]
    pub verify_liveness: bool,
    /// Addresses registered in the fixed IP pool at startup.
    #[serde(default)]
    pub fixed_ips: Vec<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonitorMode {
    #[default]
    Detached,
    InProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_root() -> PathBuf {
    PathBuf::from("/var/lib/shepherd/containers")
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("/var/run/shepherd")
}

fn default_listen() -> String {
    "127.0.0.1:4270".to_string()
}

fn default_true() -> bool {
    true
}

fn default_attempts() -> u32 {
    RetryPolicy::default().attempts
}

fn default_delay_ms() -> u64 {
    RetryPolicy::default().delay.as_millis() as u64
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl NotifyConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            delay: Duration::from_millis(self.delay_ms),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            run_dir: default_run_dir(),
            listen: default_listen(),
            monitor_mode: MonitorMode::default(),
            notify: NotifyConfig::default(),
            verify_liveness: true,
            fixed_ips: vec![],
        }
    }
}

impl DaemonConfig {
    /// Read the config at `path`, writing the defaults there first if it does not exist.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!(
                "Config not found at {}, creating default configuration",
                path.display()
            );
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("Failed to create config directory")?;
            }
            let default_toml = toml::to_string_pretty(&DaemonConfig::default())
                .context("Failed to serialize default config")?;
            fs::write(path, default_toml).context("Failed to write config file")?;
        }
        Self::load(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let cfg_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&cfg_str)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }
}

/// Settings a Monitor Process picks up from its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorEnv {
    pub notify: RetryPolicy,
    pub run_dir: PathBuf,
}

impl MonitorEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = RetryPolicy::default();
        let attempts = lookup(ENV_NOTIFY_ATTEMPTS)
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.attempts);
        let delay = lookup(ENV_NOTIFY_DELAY_MS)
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.delay);
        let run_dir = lookup(ENV_RUN_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(default_run_dir);
        Self {
            notify: RetryPolicy { attempts, delay },
            run_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let cfg: DaemonConfig = toml::from_str(
            r#"
            listen = "127.0.0.1:9999"
            monitor_mode = "in-process"
            fixed_ips = ["10.0.0.5"]

            [notify]
            attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9999");
        assert_eq!(cfg.monitor_mode, MonitorMode::InProcess);
        assert_eq!(cfg.notify.attempts, 2);
        assert_eq!(cfg.notify.delay_ms, 3000);
        assert_eq!(cfg.root, default_root());
        assert!(cfg.verify_liveness);
        assert_eq!(cfg.fixed_ips.len(), 1);
    }

    #[test]
    fn test_load_or_init_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc").join("shepherd.toml");
        let cfg = DaemonConfig::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg, DaemonConfig::default());
    }

    #[test]
    fn test_monitor_env_overrides() {
        let env = MonitorEnv::from_lookup(|key| match key {
            ENV_NOTIFY_ATTEMPTS => Some("7".into()),
            ENV_NOTIFY_DELAY_MS => Some("25".into()),
            _ => None,
        });
        assert_eq!(env.notify.attempts, 7);
        assert_eq!(env.notify.delay, Duration::from_millis(25));
        assert_eq!(env.run_dir, default_run_dir());
    }
}
