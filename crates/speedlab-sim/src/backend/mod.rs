//! Emulation backend seam.
//!
//! A backend knows how to create isolated endpoints, wire links between
//! them, run commands inside an endpoint and manage background processes.
//! Everything above it (addressing, shaping, normalization, capture) is
//! expressed as commands run through [`Backend::exec`].

pub mod netns;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::error::Result;
use crate::topology::Link;

pub use netns::NetnsBackend;

/// Captured result of a command run on an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the command was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Where a spawned process's stdout or stderr goes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Redirect {
    #[default]
    Null,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub stdout: Redirect,
    pub stderr: Redirect,
    pub workdir: Option<PathBuf>,
}

impl SpawnRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdout: Redirect::Null,
            stderr: Redirect::Null,
            workdir: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdout(mut self, redirect: Redirect) -> Self {
        self.stdout = redirect;
        self
    }

    pub fn stderr(mut self, redirect: Redirect) -> Self {
        self.stderr = redirect;
        self
    }

    pub fn workdir(mut self, dir: Option<PathBuf>) -> Self {
        self.workdir = dir;
        self
    }
}

/// Backend-assigned identifier of a spawned background process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spawned {
    pub id: ProcessId,
    /// OS process id when the backend runs real processes.
    pub pid: Option<u32>,
}

/// Capability provider for a live emulated network.
pub trait Backend {
    /// Create an isolated endpoint with loopback up.
    fn create_endpoint(&mut self, endpoint: &str) -> Result<()>;

    /// Create both ends of `link` inside their endpoints and bring them up.
    fn create_link(&mut self, link: &Link) -> Result<()>;

    /// Run a command on `endpoint` and wait for it.
    fn exec(&mut self, endpoint: &str, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Start a background process on `endpoint` without waiting for it.
    fn spawn(&mut self, endpoint: &str, request: &SpawnRequest) -> Result<Spawned>;

    /// Whether anything started for `id` is still running. Must keep
    /// answering after [`Backend::terminate`] and endpoint teardown.
    fn process_alive(&mut self, id: ProcessId) -> bool;

    /// Interrupt the process, escalating to a kill after `grace`.
    fn terminate(&mut self, id: ProcessId, grace: Duration) -> Result<()>;

    /// Remove the endpoint, its interfaces and anything still running in it.
    fn destroy_endpoint(&mut self, endpoint: &str) -> Result<()>;
}
