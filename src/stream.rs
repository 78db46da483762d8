//! Workload stdio fan-out.
//!
//! Output chunks are broadcast to every attached client and appended to a
//! JSON-lines log (`container.log`) so a later attach can replay them.
//! Non-tty attach streams use the 8-byte multiplex header
//! `[stream, 0, 0, 0, len(be u32)]` so stdout and stderr can share a socket.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::driver::Pipes;

pub const LOG_FILE: &str = "container.log";

const BROADCAST_CAPACITY: usize = 1024;
const STDIN_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn frame_id(self) -> u8 {
        match self {
            StreamKind::Stdout => 1,
            StreamKind::Stderr => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub stream: StreamKind,
    pub log: String,
    pub time: DateTime<Utc>,
}

/// Write side of one output stream, handed to the driver.
#[derive(Clone)]
pub struct OutputSink {
    kind: StreamKind,
    tx: broadcast::Sender<Bytes>,
    log: Option<Arc<Mutex<File>>>,
}

impl OutputSink {
    pub fn write(&self, chunk: Bytes) {
        if let Some(log) = &self.log {
            let entry = LogEntry {
                stream: self.kind,
                log: String::from_utf8_lossy(&chunk).into_owned(),
                time: Utc::now(),
            };
            if let Ok(mut line) = serde_json::to_vec(&entry) {
                line.push(b'\n');
                if let Err(e) = log.lock().write_all(&line) {
                    log::debug!("failed to append to container log: {e}");
                }
            }
        }
        // No receivers is fine: nobody is attached.
        let _ = self.tx.send(chunk);
    }
}

pub struct Streams {
    stdout: broadcast::Sender<Bytes>,
    stderr: broadcast::Sender<Bytes>,
    stdin: Mutex<Option<mpsc::Sender<Bytes>>>,
    log: Option<Arc<Mutex<File>>>,
    log_path: Option<PathBuf>,
}

impl Default for Streams {
    fn default() -> Self {
        Self::new()
    }
}

impl Streams {
    /// Streams without a log file.
    pub fn new() -> Self {
        let (stdout, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (stderr, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            stdout,
            stderr,
            stdin: Mutex::new(None),
            log: None,
            log_path: None,
        }
    }

    /// Streams that also append to `root/container.log`.
    pub fn with_log(root: &Path) -> std::io::Result<Self> {
        let path = root.join(LOG_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            log: Some(Arc::new(Mutex::new(file))),
            log_path: Some(path),
            ..Self::new()
        })
    }

    /// Fresh pipes for one run. With `open_stdin` the previous stdin sender is replaced.
    pub fn pipes(&self, open_stdin: bool) -> Pipes {
        let stdin = if open_stdin {
            let (tx, rx) = mpsc::channel(STDIN_CAPACITY);
            *self.stdin.lock() = Some(tx);
            Some(rx)
        } else {
            *self.stdin.lock() = None;
            None
        };
        Pipes {
            stdin,
            stdout: self.sink(StreamKind::Stdout),
            stderr: self.sink(StreamKind::Stderr),
        }
    }

    fn sink(&self, kind: StreamKind) -> OutputSink {
        let tx = match kind {
            StreamKind::Stdout => self.stdout.clone(),
            StreamKind::Stderr => self.stderr.clone(),
        };
        OutputSink {
            kind,
            tx,
            log: self.log.clone(),
        }
    }

    pub fn subscribe_stdout(&self) -> broadcast::Receiver<Bytes> {
        self.stdout.subscribe()
    }

    pub fn subscribe_stderr(&self) -> broadcast::Receiver<Bytes> {
        self.stderr.subscribe()
    }

    pub fn stdin(&self) -> Option<mpsc::Sender<Bytes>> {
        self.stdin.lock().clone()
    }

    /// Everything logged so far. Unparseable lines are skipped.
    pub fn read_logs(&self) -> std::io::Result<Vec<LogEntry>> {
        let Some(path) = &self.log_path else {
            return Ok(vec![]);
        };
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            if let Ok(entry) = serde_json::from_str::<LogEntry>(&line?) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

/// Encode one chunk for an attach client: raw for tty, multiplexed otherwise.
pub fn encode(tty: bool, kind: StreamKind, payload: &[u8]) -> Bytes {
    if tty {
        return Bytes::copy_from_slice(payload);
    }
    let mut buf = BytesMut::with_capacity(8 + payload.len());
    buf.put_u8(kind.frame_id());
    buf.put_slice(&[0, 0, 0]);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}
