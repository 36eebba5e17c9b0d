//! The end-to-end harness run.
//!
//! start → normalize → capture → workloads → interact → stop. Captures on
//! every endpoint are started before the first workload, which is what keeps
//! early packets in the traces. Any startup error skips straight to
//! teardown; a background process that fails to start is only recorded.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::backend::Backend;
use crate::capture::start_capture;
use crate::config::LabConfig;
use crate::error::{Error, Result};
use crate::normalize::normalize_endpoint;
use crate::prompt::{OperatorPrompt, PromptContext};
use crate::session::{DetachedProcess, ProcessKind, Session, SessionState};
use crate::topology::Topology;
use crate::workload::launch_workload;

pub const REPORT_FILE: &str = "session.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpawnFailure {
    pub endpoint: String,
    pub label: String,
    pub kind: ProcessKind,
    pub error: String,
}

/// Summary of a completed run, also written to `session.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub topology: Topology,
    pub processes: Vec<DetachedProcess>,
    pub spawn_failures: Vec<SpawnFailure>,
    pub final_state: SessionState,
    pub output_dir: PathBuf,
}

impl RunReport {
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Run the whole lab on `backend`, handing control to `prompt` once
/// everything is up. Teardown runs before this returns, whatever happened.
pub fn run<B, P>(config: &LabConfig, backend: B, prompt: &mut P) -> Result<RunReport>
where
    B: Backend,
    P: OperatorPrompt + ?Sized,
{
    std::fs::create_dir_all(&config.output_dir)?;

    let mut session = Session::new(config.topology.clone(), backend, config.session.clone());
    session.start()?;

    let mut failures = Vec::new();
    let outcome = drive(&mut session, config, prompt, &mut failures);
    let stopped = session.stop();

    if let Err(err) = outcome {
        if let Err(stop_err) = stopped {
            tracing::warn!(error = %stop_err, "teardown after failure was incomplete");
        }
        return Err(err);
    }
    stopped?;

    let report = RunReport {
        topology: session.topology().clone(),
        processes: session.processes().to_vec(),
        spawn_failures: failures,
        final_state: session.state(),
        output_dir: config.output_dir.clone(),
    };
    let path = config.output_dir.join(REPORT_FILE);
    if let Err(err) = report.write_json(&path) {
        tracing::warn!(path = %path.display(), error = %err, "failed to write run report");
    }
    Ok(report)
}

fn drive<B, P>(
    session: &mut Session<B>,
    config: &LabConfig,
    prompt: &mut P,
    failures: &mut Vec<SpawnFailure>,
) -> Result<()>
where
    B: Backend,
    P: OperatorPrompt + ?Sized,
{
    let endpoints: Vec<String> = config
        .topology
        .endpoint_names()
        .map(str::to_string)
        .collect();

    for endpoint in &endpoints {
        normalize_endpoint(session, endpoint, &config.normalize)?;
    }

    if let Some(capture) = &config.capture {
        for endpoint in &endpoints {
            let result = start_capture(session, endpoint, &config.output_dir, capture);
            tolerate_spawn_failure(result, endpoint, &capture.program, ProcessKind::Capture, failures)?;
        }
    }

    for workload in &config.workloads {
        let result = launch_workload(session, workload, &config.output_dir);
        tolerate_spawn_failure(
            result,
            &workload.endpoint,
            &workload.label,
            ProcessKind::Workload,
            failures,
        )?;
    }

    session.enter_interactive()?;
    let ctx = PromptContext {
        topology: session.topology(),
        processes: session.processes(),
        failures: failures.as_slice(),
        output_dir: &config.output_dir,
    };
    prompt.interact(&ctx)
}

fn tolerate_spawn_failure(
    result: Result<DetachedProcess>,
    endpoint: &str,
    label: &str,
    kind: ProcessKind,
    failures: &mut Vec<SpawnFailure>,
) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if err.is_spawn_failure() => {
            tracing::warn!(endpoint, label, error = %err, "background process failed to start");
            failures.push(SpawnFailure {
                endpoint: endpoint.to_string(),
                label: label.to_string(),
                kind,
                error: err.to_string(),
            });
            Ok(())
        }
        Err(err) => Err(err),
    }
}
