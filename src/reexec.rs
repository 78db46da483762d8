//! Self re-exec dispatch.
//!
//! The daemon binary doubles as the Monitor Process: it is spawned again with
//! a well-known `argv[0]`, and [`Registry::init`] routes that name to the
//! matching entry point before normal argument parsing happens.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;

use crate::monitor::process::{self, MONITOR_COMMAND};

pub type EntryPoint = fn();

#[derive(Debug, thiserror::Error)]
pub enum ReexecError {
    #[error("reexec func already registered under name {0:?}")]
    Duplicate(String),
}

#[derive(Default)]
pub struct Registry {
    entries: HashMap<String, EntryPoint>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry points this binary knows how to run.
    pub fn builtin() -> Result<Self, ReexecError> {
        let mut registry = Self::new();
        registry.register(MONITOR_COMMAND, process::main)?;
        Ok(registry)
    }

    pub fn register(&mut self, name: &str, entry: EntryPoint) -> Result<(), ReexecError> {
        if self.entries.contains_key(name) {
            return Err(ReexecError::Duplicate(name.to_string()));
        }
        self.entries.insert(name.to_string(), entry);
        Ok(())
    }

    pub fn lookup(&self, argv0: &OsStr) -> Option<EntryPoint> {
        argv0.to_str().and_then(|name| self.entries.get(name).copied())
    }

    /// Run the entry point registered under the current `argv[0]`, if any.
    /// Returns whether one ran.
    pub fn init(&self) -> bool {
        let Some(argv0) = std::env::args_os().next() else {
            return false;
        };
        match self.lookup(&argv0) {
            Some(entry) => {
                entry();
                true
            }
            None => false,
        }
    }
}

/// Path of the running executable.
pub fn self_exe() -> std::io::Result<PathBuf> {
    std::env::current_exe()
}

/// A command that re-executes this binary with `argv[0] = name`.
pub fn command(name: &str) -> std::io::Result<tokio::process::Command> {
    let mut cmd = std::process::Command::new(self_exe()?);
    cmd.arg0(name);
    Ok(tokio::process::Command::from(cmd))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() {}

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = Registry::new();
        registry.register("entry", noop).unwrap();
        assert!(matches!(
            registry.register("entry", noop),
            Err(ReexecError::Duplicate(name)) if name == "entry"
        ));
    }

    #[test]
    fn test_builtin_has_monitor() {
        let registry = Registry::builtin().unwrap();
        assert!(registry.lookup(OsStr::new(MONITOR_COMMAND)).is_some());
        assert!(registry.lookup(OsStr::new("shepherd")).is_none());
    }

    #[test]
    fn test_command_sets_argv0() {
        let cmd = command(MONITOR_COMMAND).unwrap();
        assert_eq!(cmd.as_std().get_program(), self_exe().unwrap().as_os_str());
    }
}
