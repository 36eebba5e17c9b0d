//! Live session controller.
//!
//! A [`Session`] owns a [`Topology`] and the [`Backend`] that realises it,
//! and walks the `Built → Started → Interactive → Stopped` lifecycle. Every
//! workflow step takes the session explicitly; there is no ambient state.
//!
//! Teardown runs at most once. [`Session::stop`] is reachable from every
//! state, a failed [`Session::start`] performs it before returning, and
//! dropping a session that was never stopped performs it as well.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::backend::{Backend, CommandOutput, ProcessId};
use crate::error::{Error, Result};
use crate::shaping::apply_shaping;
use crate::topology::{Interface, LinkShaping, Topology};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Built,
    Started,
    Interactive,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Built => "built",
            SessionState::Started => "started",
            SessionState::Interactive => "interactive",
            SessionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Give every endpoint its default `10.0.0.<n>/8` address on start.
    pub assign_addresses: bool,
    /// How long a background process gets after SIGINT before it is killed.
    pub terminate_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            assign_addresses: true,
            terminate_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Capture,
    Workload,
}

/// Handle to a background process started on an endpoint.
///
/// The session keeps the OS-level process; the handle only identifies it,
/// so liveness can be checked through [`Session::process_alive`] even after
/// teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetachedProcess {
    pub id: ProcessId,
    pub endpoint: String,
    pub label: String,
    pub kind: ProcessKind,
    pub pid: Option<u32>,
}

pub struct Session<B: Backend> {
    topology: Topology,
    backend: B,
    options: SessionOptions,
    state: SessionState,
    created: Vec<String>,
    processes: Vec<DetachedProcess>,
}

impl<B: Backend> Session<B> {
    pub fn new(topology: Topology, backend: B, options: SessionOptions) -> Self {
        Self {
            topology,
            backend,
            options,
            state: SessionState::Built,
            created: Vec::new(),
            processes: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn processes(&self) -> &[DetachedProcess] {
        &self.processes
    }

    /// Instantiate the topology: endpoints, links, addresses and shaping.
    ///
    /// On failure everything created so far is torn down and the session is
    /// left `Stopped`.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Built {
            return Err(self.invalid_state("start"));
        }

        tracing::info!(
            endpoints = self.topology.endpoints().len(),
            links = self.topology.links().len(),
            "starting session"
        );
        match self.instantiate() {
            Ok(()) => {
                self.state = SessionState::Started;
                tracing::info!("session started");
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "session start failed, tearing down");
                if let Err(stop_err) = self.stop() {
                    tracing::warn!(error = %stop_err, "teardown after failed start was incomplete");
                }
                Err(err)
            }
        }
    }

    fn instantiate(&mut self) -> Result<()> {
        let names: Vec<String> = self.topology.endpoint_names().map(str::to_string).collect();
        for name in names {
            // Recorded before the call so a half-created endpoint is still
            // destroyed on teardown.
            self.created.push(name.clone());
            self.backend.create_endpoint(&name)?;
        }

        for link in self.topology.links() {
            self.backend.create_link(link)?;
        }

        if self.options.assign_addresses {
            for endpoint in self.topology.endpoints() {
                let cidr = format!("{}/8", endpoint.default_address());
                for iface in &endpoint.interfaces {
                    let output = self.backend.exec(
                        &endpoint.name,
                        "ip",
                        &["addr", "add", &cidr, "dev", &iface.name],
                    )?;
                    if !output.success() {
                        return Err(Error::ResourceAllocation {
                            resource: format!("address {cidr} on {}", iface.name),
                            reason: output.stderr.trim().to_string(),
                        });
                    }
                }
            }
        }

        for link in self.topology.links() {
            for (endpoint, iface) in [(&link.a, &link.a_interface), (&link.b, &link.b_interface)] {
                apply_shaping(&mut self.backend, endpoint, iface, &link.shaping).map_err(|e| {
                    Error::ResourceAllocation {
                        resource: format!("shaping on {iface}"),
                        reason: e.to_string(),
                    }
                })?;
            }
        }
        Ok(())
    }

    /// Hand the session to the operator.
    pub fn enter_interactive(&mut self) -> Result<()> {
        if self.state != SessionState::Started {
            return Err(self.invalid_state("enter_interactive"));
        }
        self.state = SessionState::Interactive;
        Ok(())
    }

    /// Tear down every spawned process and every endpoint.
    ///
    /// Keeps going past individual failures so nothing is leaked; the first
    /// failure is returned once everything has been attempted. Calling it on
    /// a stopped session does nothing.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == SessionState::Stopped {
            return Ok(());
        }
        tracing::info!(
            from = %self.state,
            processes = self.processes.len(),
            endpoints = self.created.len(),
            "stopping session"
        );
        self.state = SessionState::Stopped;

        let mut first_err = None;
        for process in self.processes.iter().rev() {
            if let Err(err) = self.backend.terminate(process.id, self.options.terminate_grace) {
                tracing::warn!(id = %process.id, label = %process.label, error = %err, "failed to terminate process");
                first_err.get_or_insert(err);
            }
        }
        for endpoint in self.created.drain(..).rev() {
            if let Err(err) = self.backend.destroy_endpoint(&endpoint) {
                tracing::warn!(endpoint = %endpoint, error = %err, "failed to destroy endpoint");
                first_err.get_or_insert(err);
            }
        }

        // Anything the backend still reports as running has escaped teardown.
        for process in &self.processes {
            if self.backend.process_alive(process.id) {
                tracing::error!(
                    id = %process.id,
                    label = %process.label,
                    "process survived teardown"
                );
                first_err.get_or_insert(Error::ResourceAllocation {
                    resource: format!("process {} ({})", process.id, process.label),
                    reason: "still running after teardown".into(),
                });
            }
        }

        tracing::info!("session stopped");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Replace the shaping on both ends of a link.
    pub fn reshape_link(&mut self, link: usize, shaping: LinkShaping) -> Result<()> {
        self.require_live("reshape_link")?;
        if shaping.rate_kbit == 0 {
            return Err(crate::error::ConfigurationError::ZeroBandwidth { link }.into());
        }
        let (a, a_iface, b, b_iface) = {
            let l = self.topology.links().get(link).ok_or_else(|| {
                crate::error::ConfigurationError::Invalid(format!("no link with index {link}"))
            })?;
            (l.a.clone(), l.a_interface.clone(), l.b.clone(), l.b_interface.clone())
        };
        apply_shaping(&mut self.backend, &a, &a_iface, &shaping)?;
        apply_shaping(&mut self.backend, &b, &b_iface, &shaping)?;
        tracing::info!(link, rate_kbit = shaping.rate_kbit, "link reshaped");
        Ok(())
    }

    /// Whether a background process started by this session is still
    /// running. Asks the backend in every state, so a process that outlived
    /// [`Session::stop`] shows up here.
    pub fn process_alive(&mut self, process: &DetachedProcess) -> bool {
        self.backend.process_alive(process.id)
    }

    /// Run a command on an endpoint of the live session.
    pub fn exec(&mut self, endpoint: &str, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.require_live("exec")?;
        if self.topology.endpoint(endpoint).is_none() {
            return Err(Error::InterfaceNotFound {
                endpoint: endpoint.to_string(),
                interface: "*".to_string(),
            });
        }
        self.backend.exec(endpoint, program, args)
    }

    /// Addresses (`addr/prefix`, IPv4 and IPv6) assigned to an interface.
    pub fn addresses(&mut self, endpoint: &str, index: usize) -> Result<Vec<String>> {
        let iface = self.resolve_interface(endpoint, index)?.name;
        let output = self.exec_checked(endpoint, "ip", &["-o", "addr", "show", "dev", &iface])?;
        Ok(parse_addresses(&output.stdout))
    }

    // ── Crate-internal helpers for the workflow steps ──────────────

    pub(crate) fn require_live(&self, operation: &'static str) -> Result<()> {
        match self.state {
            SessionState::Started | SessionState::Interactive => Ok(()),
            _ => Err(self.invalid_state(operation)),
        }
    }

    /// Look up an interface in the topology and confirm it exists live.
    pub(crate) fn resolve_interface(&mut self, endpoint: &str, index: usize) -> Result<Interface> {
        self.require_live("resolve_interface")?;
        let not_found = || Error::InterfaceNotFound {
            endpoint: endpoint.to_string(),
            interface: crate::topology::interface_name(endpoint, index),
        };
        let iface = self
            .topology
            .interface(endpoint, index)
            .cloned()
            .ok_or_else(not_found)?;
        let output = self
            .backend
            .exec(endpoint, "ip", &["link", "show", "dev", &iface.name])?;
        if !output.success() {
            return Err(not_found());
        }
        Ok(iface)
    }

    /// Run a command, turning a nonzero exit into `CommandExecution`.
    pub(crate) fn exec_checked(
        &mut self,
        endpoint: &str,
        program: &str,
        args: &[&str],
    ) -> Result<CommandOutput> {
        let output = self.backend.exec(endpoint, program, args)?;
        if !output.success() {
            let mut command = program.to_string();
            for arg in args {
                command.push(' ');
                command.push_str(arg);
            }
            return Err(Error::CommandExecution {
                endpoint: endpoint.to_string(),
                command,
                status: output.status,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    pub(crate) fn spawn(
        &mut self,
        endpoint: &str,
        label: &str,
        kind: ProcessKind,
        request: &crate::backend::SpawnRequest,
    ) -> Result<DetachedProcess> {
        self.require_live("spawn")?;
        let spawned = self.backend.spawn(endpoint, request)?;
        let process = DetachedProcess {
            id: spawned.id,
            endpoint: endpoint.to_string(),
            label: label.to_string(),
            kind,
            pid: spawned.pid,
        };
        tracing::info!(
            endpoint,
            label,
            id = %process.id,
            pid = ?process.pid,
            "background process started"
        );
        self.processes.push(process.clone());
        Ok(process)
    }

    pub(crate) fn has_capture(&self, endpoint: &str) -> bool {
        self.processes
            .iter()
            .any(|p| p.kind == ProcessKind::Capture && p.endpoint == endpoint)
    }

    /// Forget a process that exited during startup, reaping it first.
    pub(crate) fn discard(&mut self, process: &DetachedProcess) {
        if let Err(err) = self.backend.terminate(process.id, Duration::ZERO) {
            tracing::debug!(id = %process.id, error = %err, "reaping exited process failed");
        }
        self.processes.retain(|p| p.id != process.id);
    }

    fn invalid_state(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            state: self.state,
        }
    }
}

impl<B: Backend> Drop for Session<B> {
    fn drop(&mut self) {
        if self.state != SessionState::Stopped {
            tracing::warn!(state = %self.state, "session dropped without stop, tearing down");
            let _ = self.stop();
        }
    }
}

/// Extract `addr/prefix` entries from `ip -o addr show` output.
fn parse_addresses(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            tokens.find(|t| *t == "inet" || *t == "inet6")?;
            tokens.next().map(str::to_string)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{BackendCall, RecordingBackend};
    use crate::topology::LinkShaping;

    fn two_hosts() -> Topology {
        Topology::builder()
            .endpoint("A")
            .endpoint("B")
            .link("A", "B", LinkShaping::new(100, Duration::from_millis(100)))
            .build()
            .unwrap()
    }

    #[test]
    fn start_creates_endpoints_links_addresses_and_shaping() {
        let backend = RecordingBackend::new();
        let mut session = Session::new(two_hosts(), backend.clone(), SessionOptions::default());
        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Started);

        assert!(backend.endpoint_alive("A"));
        assert!(backend.endpoint_alive("B"));
        assert!(backend.addresses("A-eth0").contains(&"10.0.0.1/8".to_string()));
        assert!(backend.addresses("B-eth0").contains(&"10.0.0.2/8".to_string()));
        let qdisc = backend.qdisc("B-eth0").unwrap();
        assert!(qdisc.contains("delay 100ms"), "{qdisc}");
        assert!(qdisc.contains("rate 100000kbit"), "{qdisc}");
    }

    #[test]
    fn lifecycle_walks_all_states() {
        let mut session = Session::new(two_hosts(), RecordingBackend::new(), SessionOptions::default());
        assert_eq!(session.state(), SessionState::Built);
        assert!(matches!(
            session.enter_interactive(),
            Err(Error::InvalidState { .. })
        ));
        session.start().unwrap();
        session.enter_interactive().unwrap();
        assert_eq!(session.state(), SessionState::Interactive);
        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(matches!(session.start(), Err(Error::InvalidState { .. })));
    }

    #[test]
    fn stop_is_idempotent_and_destroys_each_endpoint_once() {
        let backend = RecordingBackend::new();
        let mut session = Session::new(two_hosts(), backend.clone(), SessionOptions::default());
        session.start().unwrap();
        session.stop().unwrap();
        session.stop().unwrap();
        drop(session);

        assert_eq!(backend.count(|c| matches!(c, BackendCall::DestroyEndpoint(_))), 2);
        assert!(backend.live_interfaces().is_empty());
    }

    #[test]
    fn dropping_a_started_session_tears_it_down() {
        let backend = RecordingBackend::new();
        {
            let mut session = Session::new(two_hosts(), backend.clone(), SessionOptions::default());
            session.start().unwrap();
        }
        assert!(!backend.endpoint_alive("A"));
        assert!(!backend.endpoint_alive("B"));
    }

    #[test]
    fn failed_start_releases_partial_resources() {
        let backend = RecordingBackend::new();
        backend.fail_create_link("A-eth0");
        let mut session = Session::new(two_hosts(), backend.clone(), SessionOptions::default());

        let err = session.start().unwrap_err();
        assert!(matches!(err, Error::ResourceAllocation { .. }), "{err}");
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!backend.endpoint_alive("A"));
        assert!(!backend.endpoint_alive("B"));
    }

    #[test]
    fn process_surviving_teardown_is_visible_and_reported() {
        let backend = RecordingBackend::new();
        backend.ignore_termination("sh");
        let mut session = Session::new(two_hosts(), backend.clone(), SessionOptions::default());
        session.start().unwrap();
        let request = crate::backend::SpawnRequest::new("sh").args(["-c", "sleep 600"]);
        let stubborn = session
            .spawn("A", "stubborn", ProcessKind::Workload, &request)
            .unwrap();

        let err = session.stop().unwrap_err();
        assert!(matches!(err, Error::ResourceAllocation { .. }), "{err}");
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.process_alive(&stubborn));
    }

    #[test]
    fn addresses_lists_v4_and_v6() {
        let backend = RecordingBackend::new();
        let mut session = Session::new(two_hosts(), backend, SessionOptions::default());
        session.start().unwrap();
        let addrs = session.addresses("A", 0).unwrap();
        assert!(addrs.iter().any(|a| a == "10.0.0.1/8"));
        assert!(addrs.iter().any(|a| a.starts_with("fe80::")));
    }

    #[test]
    fn reshape_link_replaces_qdisc_on_both_ends() {
        let backend = RecordingBackend::new();
        let mut session = Session::new(two_hosts(), backend.clone(), SessionOptions::default());
        session.start().unwrap();
        session
            .reshape_link(0, LinkShaping::new(10, Duration::from_millis(20)))
            .unwrap();
        for iface in ["A-eth0", "B-eth0"] {
            let qdisc = backend.qdisc(iface).unwrap();
            assert!(qdisc.contains("delay 20ms rate 10000kbit"), "{qdisc}");
        }
        assert!(session
            .reshape_link(3, LinkShaping::new(10, Duration::ZERO))
            .is_err());
    }

    #[test]
    fn parse_addresses_reads_ip_o_output() {
        let out = "2: A-eth0    inet 10.0.0.1/8 scope global A-eth0\\       valid_lft forever\n\
                   2: A-eth0    inet6 fe80::1/64 scope link \\       valid_lft forever\n";
        assert_eq!(parse_addresses(out), ["10.0.0.1/8", "fe80::1/64"]);
    }
}
