//! Durable start/stop records kept in a container's root directory.
//!
//! Two write-once slots, `start_status` and `stop_status`. A present stop
//! slot is final for the current run and wins over whatever the start slot
//! says. The Monitor Process also drops its own pid into `monitor.pid`.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::driver::ExitStatus;

pub const MONITOR_PID_FILE: &str = "monitor.pid";
pub const START_STATUS_FILE: &str = "start_status";
pub const STOP_STATUS_FILE: &str = "stop_status";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartStatus {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StartStatus {
    pub fn started(pid: u32) -> Self {
        Self { pid, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            pid: 0,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopStatus {
    #[serde(flatten)]
    pub exit: ExitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("{slot} status already recorded at {}", path.display())]
    AlreadyRecorded { slot: &'static str, path: PathBuf },

    #[error("Corrupt status file {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What the store knows about the current run, in recovery priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Stopped(StopStatus),
    Started(StartStatus),
    Nothing,
}

#[derive(Debug, Clone)]
pub struct StatusStore {
    root: PathBuf,
}

impl StatusStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn write_start(&self, status: &StartStatus) -> Result<(), StatusError> {
        self.write_slot("start", START_STATUS_FILE, status)
    }

    pub fn write_stop(&self, status: &StopStatus) -> Result<(), StatusError> {
        self.write_slot("stop", STOP_STATUS_FILE, status)
    }

    pub fn load_start(&self) -> Result<Option<StartStatus>, StatusError> {
        self.read_slot(START_STATUS_FILE)
    }

    pub fn load_stop(&self) -> Result<Option<StopStatus>, StatusError> {
        self.read_slot(STOP_STATUS_FILE)
    }

    /// Stop beats start; a corrupt stop slot is an error rather than a fallback to start.
    pub fn recorded(&self) -> Result<Recorded, StatusError> {
        if let Some(stop) = self.load_stop()? {
            return Ok(Recorded::Stopped(stop));
        }
        match self.load_start()? {
            Some(start) => Ok(Recorded::Started(start)),
            None => Ok(Recorded::Nothing),
        }
    }

    /// Drop both slots ahead of a new run.
    pub fn reset(&self) -> Result<(), StatusError> {
        for file in [START_STATUS_FILE, STOP_STATUS_FILE] {
            let path = self.root.join(file);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(StatusError::Io { path, source }),
            }
        }
        Ok(())
    }

    pub fn write_monitor_pid(&self, pid: u32) -> Result<(), StatusError> {
        write_atomic(&self.root, MONITOR_PID_FILE, pid.to_string().as_bytes(), true)
    }

    /// `None` when the file is absent or does not hold a pid.
    pub fn monitor_pid(&self) -> Option<i32> {
        std::fs::read_to_string(self.root.join(MONITOR_PID_FILE))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    fn write_slot<T: Serialize>(
        &self,
        slot: &'static str,
        file: &str,
        status: &T,
    ) -> Result<(), StatusError> {
        let path = self.root.join(file);
        let data = serde_json::to_vec(status).map_err(|source| StatusError::Corrupt {
            path: path.clone(),
            source,
        })?;
        write_atomic(&self.root, file, &data, false).map_err(|e| match e {
            StatusError::Io { source, .. } if source.kind() == std::io::ErrorKind::AlreadyExists => {
                StatusError::AlreadyRecorded { slot, path }
            }
            other => other,
        })
    }

    fn read_slot<T: for<'de> Deserialize<'de>>(&self, file: &str) -> Result<Option<T>, StatusError> {
        let path = self.root.join(file);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StatusError::Io { path, source }),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| StatusError::Corrupt { path, source })
    }
}

/// Write `data` to `dir/file` through a temp file in the same directory so
/// readers never see a torn file. With `clobber == false` an existing file is
/// left untouched and `AlreadyExists` is returned.
pub(crate) fn write_atomic(
    dir: &Path,
    file: &str,
    data: &[u8],
    clobber: bool,
) -> Result<(), StatusError> {
    let path = dir.join(file);
    let io_err = |source: std::io::Error| StatusError::Io {
        path: path.clone(),
        source,
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(data).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    if clobber {
        tmp.persist(&path).map_err(|e| io_err(e.error))?;
    } else {
        tmp.persist_noclobber(&path).map_err(|e| io_err(e.error))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_slot_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path());
        let first = StopStatus {
            exit: ExitStatus::from_code(137),
            error: None,
        };
        store.write_stop(&first).unwrap();

        let second = StopStatus {
            exit: ExitStatus::from_code(0),
            error: None,
        };
        match store.write_stop(&second) {
            Err(StatusError::AlreadyRecorded { slot, .. }) => assert_eq!(slot, "stop"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(store.load_stop().unwrap(), Some(first));
    }

    #[test]
    fn test_stop_wins_over_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path());
        assert_eq!(store.recorded().unwrap(), Recorded::Nothing);

        store.write_start(&StartStatus::started(4242)).unwrap();
        assert_eq!(
            store.recorded().unwrap(),
            Recorded::Started(StartStatus::started(4242))
        );

        let stop = StopStatus {
            exit: ExitStatus::from_code(1),
            error: None,
        };
        store.write_stop(&stop).unwrap();
        assert_eq!(store.recorded().unwrap(), Recorded::Stopped(stop));
    }

    #[test]
    fn test_reset_clears_slots_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path());
        store.write_monitor_pid(99).unwrap();
        store.write_start(&StartStatus::started(1)).unwrap();
        store.reset().unwrap();
        store.reset().unwrap();

        assert_eq!(store.recorded().unwrap(), Recorded::Nothing);
        assert_eq!(store.monitor_pid(), Some(99));
        store.write_start(&StartStatus::started(2)).unwrap();
    }

    #[test]
    fn test_corrupt_slot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STOP_STATUS_FILE), b"{not json").unwrap();
        let store = StatusStore::new(dir.path());
        assert!(matches!(store.recorded(), Err(StatusError::Corrupt { .. })));
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_value(StopStatus {
            exit: ExitStatus::from_code(137),
            error: Some("killed".into()),
        })
        .unwrap();
        assert_eq!(json["exit_code"], 137);
        assert_eq!(json["error"], "killed");

        let start: StartStatus = serde_json::from_str(r#"{"pid":12}"#).unwrap();
        assert_eq!(start, StartStatus::started(12));
    }
}
