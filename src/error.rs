use crate::driver::DriverError;
use crate::ipalloc::IpAllocError;
use crate::status::StatusError;

/// Errors surfaced by daemon-side container operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No such container: {0}")]
    NotFound(String),

    #[error("Container {0} already exists")]
    AlreadyExists(String),

    #[error("Container already started")]
    AlreadyStarted,

    #[error("Container already stopped")]
    AlreadyStopped,

    #[error("Cannot start a paused container, try unpause instead.")]
    Paused,

    #[error("Container {0} is not running")]
    NotRunning(String),

    #[error("Container {id} failed to start: {message}")]
    StartFailed { id: String, message: String },

    #[error("Invalid container configuration at {path}: {message}")]
    Config { path: String, message: String },

    #[error("Status store error: {0}")]
    Status(#[from] StatusError),

    #[error("Execution driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Fixed IP allocation error: {0}")]
    Ip(#[from] IpAllocError),

    #[error("Signal delivery failed: {0}")]
    Signal(#[from] nix::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Duplicate-delivery rejections; the notifier treats these as "already applied".
    pub fn is_already_applied(&self) -> bool {
        matches!(self, Error::AlreadyStarted | Error::AlreadyStopped)
    }
}
