//! shepherd - detached per-container supervision.
//!
//! A daemon hands each container to a Monitor Process re-executed from its own
//! binary. The monitor owns the workload, records start/stop outcomes in the
//! container's root directory and pushes them back to the daemon over HTTP.
//! After a daemon restart, [`daemon::restore`] rebuilds container state from
//! those records.

pub mod config;
pub mod container;
pub mod daemon;
pub mod driver;
pub mod error;
pub mod gate;
pub mod ipalloc;
pub mod logging;
pub mod monitor;
pub mod notify;
pub mod reexec;
pub mod status;
pub mod stream;

pub use error::{Error, Result};
