//! Per-endpoint packet capture.
//!
//! A capture must be running before any workload on the same endpoint
//! starts sending, otherwise the first packets are lost. The launcher waits
//! until the capture tool reports it is listening (or a timeout passes), so
//! a caller that launches workloads afterwards gets that ordering.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::backend::{Backend, Redirect, SpawnRequest};
use crate::error::{Error, Result};
use crate::session::{DetachedProcess, ProcessKind, Session};

/// Line tcpdump prints on stderr once it is bound to its interface.
pub const READY_MARKER: &str = "listening on";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOptions {
    pub program: String,
    /// Extra arguments placed before the interface and output flags.
    pub extra_args: Vec<String>,
    /// Zero skips the readiness wait.
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            program: "tcpdump".into(),
            extra_args: Vec::new(),
            ready_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(50),
        }
    }
}

pub fn capture_path(output_dir: &Path, endpoint: &str) -> PathBuf {
    output_dir.join(format!("{endpoint}.pcap"))
}

pub fn capture_log_path(output_dir: &Path, endpoint: &str) -> PathBuf {
    output_dir.join(format!("{endpoint}.capture.log"))
}

/// Start capturing on every interface of `endpoint` into
/// `<output_dir>/<endpoint>.pcap`.
pub fn start_capture<B: Backend>(
    session: &mut Session<B>,
    endpoint: &str,
    output_dir: &Path,
    options: &CaptureOptions,
) -> Result<DetachedProcess> {
    let interfaces: Vec<String> = session
        .topology()
        .endpoint(endpoint)
        .ok_or_else(|| Error::Spawn {
            endpoint: endpoint.to_string(),
            label: options.program.clone(),
            reason: "endpoint is not part of the topology".into(),
        })?
        .interfaces
        .iter()
        .map(|i| i.name.clone())
        .collect();
    let bind = match interfaces.as_slice() {
        [single] => single.clone(),
        _ => "any".to_string(),
    };

    let pcap = capture_path(output_dir, endpoint);
    let log = capture_log_path(output_dir, endpoint);
    let request = SpawnRequest::new(options.program.clone())
        .args(options.extra_args.iter().cloned())
        .args(["-U".to_string(), "-i".to_string(), bind.clone(), "-w".to_string()])
        .args([pcap.to_string_lossy().into_owned()])
        .stderr(Redirect::File(log.clone()));

    let process = session.spawn(endpoint, &options.program, ProcessKind::Capture, &request)?;

    match wait_until_listening(session, &process, &log, options) {
        Readiness::Listening => {
            tracing::info!(endpoint, interface = %bind, file = %pcap.display(), "capture listening");
        }
        Readiness::TimedOut => {
            if !options.ready_timeout.is_zero() {
                tracing::warn!(
                    endpoint,
                    log = %log.display(),
                    timeout_ms = options.ready_timeout.as_millis() as u64,
                    "capture did not report readiness in time, early packets may be missed"
                );
            }
        }
        Readiness::Exited => {
            session.discard(&process);
            return Err(Error::Spawn {
                endpoint: endpoint.to_string(),
                label: options.program.clone(),
                reason: exit_reason(&log),
            });
        }
    }
    Ok(process)
}

enum Readiness {
    Listening,
    TimedOut,
    Exited,
}

/// Poll the capture log until the ready line shows up, the capture dies, or
/// the timeout passes. Runs at least once, so a capture that died on spawn
/// is caught even with a zero timeout.
fn wait_until_listening<B: Backend>(
    session: &mut Session<B>,
    process: &DetachedProcess,
    log: &Path,
    options: &CaptureOptions,
) -> Readiness {
    let deadline = Instant::now() + options.ready_timeout;
    loop {
        if let Ok(contents) = std::fs::read_to_string(log) {
            if contents.contains(READY_MARKER) {
                return Readiness::Listening;
            }
        }
        if !session.process_alive(process) {
            return Readiness::Exited;
        }
        if Instant::now() >= deadline {
            return Readiness::TimedOut;
        }
        std::thread::sleep(options.poll_interval);
    }
}

/// Last lines of the capture log, for the spawn failure report.
fn exit_reason(log: &Path) -> String {
    let contents = std::fs::read_to_string(log).unwrap_or_default();
    let lines: Vec<&str> = contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        return "exited before it started listening".to_string();
    }
    let tail = &lines[lines.len().saturating_sub(3)..];
    format!("exited before it started listening: {}", tail.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionOptions;
    use crate::test_util::{BackendCall, RecordingBackend};
    use crate::topology::{LinkShaping, Topology};

    fn options() -> CaptureOptions {
        CaptureOptions {
            ready_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn session(backend: &RecordingBackend) -> Session<RecordingBackend> {
        let topo = Topology::builder()
            .endpoint("left")
            .endpoint("mid")
            .endpoint("right")
            .link("left", "mid", LinkShaping::new(100, Duration::from_millis(10)))
            .link("mid", "right", LinkShaping::new(100, Duration::from_millis(10)))
            .build()
            .unwrap();
        let mut session = Session::new(topo, backend.clone(), SessionOptions::default());
        session.start().unwrap();
        session
    }

    #[test]
    fn capture_binds_single_interface_and_writes_per_endpoint_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RecordingBackend::new();
        backend.stderr_banner("tcpdump", "tcpdump: listening on left-eth0, link-type EN10MB\n");
        let mut session = session(&backend);

        let process = start_capture(&mut session, "left", dir.path(), &options()).unwrap();
        assert_eq!(process.kind, ProcessKind::Capture);
        assert!(session.has_capture("left"));
        assert!(session.process_alive(&process));

        let spawn = backend
            .calls()
            .into_iter()
            .find_map(|c| match c {
                BackendCall::Spawn { endpoint, program, args } if program == "tcpdump" => {
                    Some((endpoint, args))
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(spawn.0, "left");
        let expected = capture_path(dir.path(), "left").to_string_lossy().into_owned();
        assert_eq!(spawn.1, ["-U", "-i", "left-eth0", "-w", expected.as_str()]);
    }

    #[test]
    fn capture_on_multi_homed_endpoint_listens_on_any() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RecordingBackend::new();
        let mut session = session(&backend);

        let no_wait = CaptureOptions {
            ready_timeout: Duration::ZERO,
            ..options()
        };
        start_capture(&mut session, "mid", dir.path(), &no_wait).unwrap();
        let args = backend
            .calls()
            .into_iter()
            .find_map(|c| match c {
                BackendCall::Spawn { args, .. } => Some(args),
                _ => None,
            })
            .unwrap();
        assert_eq!(args[2], "any");
    }

    #[test]
    fn readiness_wait_times_out_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RecordingBackend::new();
        let mut session = session(&backend);

        let started = Instant::now();
        let process = start_capture(&mut session, "right", dir.path(), &options()).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(session.process_alive(&process));
    }

    #[test]
    fn capture_that_exits_at_once_is_a_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RecordingBackend::new();
        backend.exit_on_spawn(
            "tcpdump",
            "tcpdump: left-eth0: You don't have permission to capture on that device\n",
        );
        let mut session = session(&backend);

        let no_wait = CaptureOptions {
            ready_timeout: Duration::ZERO,
            ..options()
        };
        let err = start_capture(&mut session, "left", dir.path(), &no_wait).unwrap_err();
        assert!(err.is_spawn_failure(), "{err}");
        assert!(err.to_string().contains("permission to capture"), "{err}");
        assert!(!session.has_capture("left"));
        assert!(session.processes().is_empty());
    }

    #[test]
    fn spawn_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RecordingBackend::new();
        backend.fail_spawn("tcpdump");
        let mut session = session(&backend);

        let err = start_capture(&mut session, "left", dir.path(), &options()).unwrap_err();
        assert!(err.is_spawn_failure(), "{err}");
        assert!(!session.has_capture("left"));
    }
}
