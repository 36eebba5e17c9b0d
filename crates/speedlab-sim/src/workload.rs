//! Background test programs run on endpoints.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::backend::{Backend, Redirect, SpawnRequest};
use crate::error::{Error, Result};
use crate::session::{DetachedProcess, ProcessKind, Session};

/// A shell command line to run detached on an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Workload {
    pub label: String,
    pub endpoint: String,
    /// Passed verbatim to `sh -c`.
    pub command: String,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
}

impl Workload {
    pub fn new(
        label: impl Into<String>,
        endpoint: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            endpoint: endpoint.into(),
            command: command.into(),
            stdout: None,
            stderr: None,
            workdir: None,
        }
    }

    pub fn stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn stderr(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr = Some(path.into());
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }
}

/// Start `workload` without waiting for it. Relative redirect paths are
/// placed under `output_dir`.
pub fn launch_workload<B: Backend>(
    session: &mut Session<B>,
    workload: &Workload,
    output_dir: &Path,
) -> Result<DetachedProcess> {
    if session.topology().endpoint(&workload.endpoint).is_none() {
        return Err(Error::Spawn {
            endpoint: workload.endpoint.clone(),
            label: workload.label.clone(),
            reason: "endpoint is not part of the topology".into(),
        });
    }
    if !session.has_capture(&workload.endpoint) {
        tracing::warn!(
            endpoint = %workload.endpoint,
            label = %workload.label,
            "no capture running on endpoint, its traffic will not be recorded"
        );
    }

    let redirect = |path: &Option<PathBuf>| match path {
        Some(p) => Redirect::File(resolve(output_dir, p)),
        None => Redirect::Null,
    };
    let request = SpawnRequest::new("sh")
        .args(["-c".to_string(), workload.command.clone()])
        .stdout(redirect(&workload.stdout))
        .stderr(redirect(&workload.stderr))
        .workdir(workload.workdir.clone());

    session
        .spawn(&workload.endpoint, &workload.label, ProcessKind::Workload, &request)
        .map_err(|err| match err {
            Error::Spawn { endpoint, reason, .. } => Error::Spawn {
                endpoint,
                label: workload.label.clone(),
                reason,
            },
            other => other,
        })
}

fn resolve(output_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        output_dir.join(path)
    }
}
