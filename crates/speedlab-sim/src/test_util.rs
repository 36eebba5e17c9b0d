//! Helpers for tests: environment probes for live namespace tests and an
//! in-memory [`RecordingBackend`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::backend::{Backend, CommandOutput, ProcessId, Redirect, SpawnRequest, Spawned};
use crate::error::{Error, Result};
use crate::topology::Link;

static PREFIX_SEQ: AtomicU32 = AtomicU32::new(0);

/// `true` when `sudo -n ip netns` works, i.e. live namespace tests can run.
pub fn check_privileges() -> bool {
    Command::new("sudo")
        .args(["-n", "ip", "netns"])
        .output()
        .is_ok_and(|o| o.status.success())
}

/// Namespace prefix for one live test: `<tag>_<pid>_<seq>`, cut to 15 bytes.
///
/// Live tests hand it to [`crate::backend::NetnsBackend::new`] so their
/// namespaces never clash with a real lab or with a parallel test.
pub fn unique_ns_name(tag: &str) -> String {
    let seq = PREFIX_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = format!("{tag}_{:x}_{seq}", std::process::id() & 0xffff);
    name.truncate(crate::topology::MAX_INTERFACE_NAME_LEN);
    name
}

/// Offload features a simulated interface knows about; all start enabled.
pub const SIMULATED_OFFLOADS: &[&str] = &["tx", "rx", "sg", "tso", "gso", "gro"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    CreateEndpoint(String),
    CreateLink { a: String, b: String },
    Exec { endpoint: String, command: String },
    Spawn {
        endpoint: String,
        program: String,
        args: Vec<String>,
    },
    Terminate(ProcessId),
    DestroyEndpoint(String),
}

#[derive(Debug, Clone)]
struct SimInterface {
    endpoint: String,
    peer: String,
    offloads: BTreeMap<String, bool>,
    addresses: BTreeSet<String>,
    qdisc: Option<String>,
}

#[derive(Debug, Clone)]
struct SimProcess {
    endpoint: String,
    program: String,
    alive: bool,
}

#[derive(Debug, Default)]
struct Recorded {
    calls: Vec<BackendCall>,
    endpoints: BTreeSet<String>,
    interfaces: BTreeMap<String, SimInterface>,
    processes: BTreeMap<ProcessId, SimProcess>,
    requests: Vec<SpawnRequest>,
    next_id: u64,
    fail_endpoints: BTreeSet<String>,
    fail_links: BTreeSet<String>,
    fail_commands: Vec<String>,
    fail_spawns: BTreeSet<String>,
    exit_on_spawn: BTreeMap<String, String>,
    unkillable: BTreeSet<String>,
    banners: HashMap<String, String>,
}

/// In-memory backend that simulates endpoints, veth links, `ip`, `ethtool`
/// and `tc`, records every call, and can be told to fail.
///
/// Clones share state, so a test can keep a handle after moving the backend
/// into a session.
#[derive(Debug, Clone, Default)]
pub struct RecordingBackend {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Failure injection ──────────────────────────────────────────

    pub fn fail_create_endpoint(&self, endpoint: &str) {
        self.lock().fail_endpoints.insert(endpoint.to_string());
    }

    /// Fail creating the link whose `a` side is `a_interface`.
    pub fn fail_create_link(&self, a_interface: &str) {
        self.lock().fail_links.insert(a_interface.to_string());
    }

    /// Fail any command whose full command line starts with `prefix`.
    pub fn fail_command(&self, prefix: &str) {
        self.lock().fail_commands.push(prefix.to_string());
    }

    pub fn fail_spawn(&self, program: &str) {
        self.lock().fail_spawns.insert(program.to_string());
    }

    /// Spawned `program` processes exit at once, leaving `stderr` in their
    /// stderr redirect.
    pub fn exit_on_spawn(&self, program: &str, stderr: &str) {
        self.lock()
            .exit_on_spawn
            .insert(program.to_string(), stderr.to_string());
    }

    /// Spawned `program` processes survive termination and endpoint
    /// teardown.
    pub fn ignore_termination(&self, program: &str) {
        self.lock().unkillable.insert(program.to_string());
    }

    /// Text written to the stderr redirect of every spawned `program`.
    pub fn stderr_banner(&self, program: &str, text: &str) {
        self.lock()
            .banners
            .insert(program.to_string(), text.to_string());
    }

    /// Simulate an interface vanishing underneath a live session.
    pub fn remove_interface(&self, name: &str) {
        self.lock().interfaces.remove(name);
    }

    // ── Inspection ─────────────────────────────────────────────────

    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&BackendCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(*c)).count()
    }

    pub fn last_request(&self) -> Option<SpawnRequest> {
        self.lock().requests.last().cloned()
    }

    pub fn endpoint_alive(&self, endpoint: &str) -> bool {
        self.lock().endpoints.contains(endpoint)
    }

    pub fn live_interfaces(&self) -> Vec<String> {
        self.lock().interfaces.keys().cloned().collect()
    }

    pub fn live_processes(&self) -> Vec<ProcessId> {
        self.lock()
            .processes
            .iter()
            .filter(|(_, p)| p.alive)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn offload(&self, interface: &str, feature: &str) -> Option<bool> {
        self.lock()
            .interfaces
            .get(interface)
            .and_then(|i| i.offloads.get(feature).copied())
    }

    pub fn addresses(&self, interface: &str) -> Vec<String> {
        self.lock()
            .interfaces
            .get(interface)
            .map(|i| i.addresses.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn qdisc(&self, interface: &str) -> Option<String> {
        self.lock()
            .interfaces
            .get(interface)
            .and_then(|i| i.qdisc.clone())
    }
}

impl Backend for RecordingBackend {
    fn create_endpoint(&mut self, endpoint: &str) -> Result<()> {
        let mut state = self.lock();
        state
            .calls
            .push(BackendCall::CreateEndpoint(endpoint.to_string()));
        if state.fail_endpoints.contains(endpoint) {
            return Err(Error::ResourceAllocation {
                resource: format!("namespace {endpoint}"),
                reason: "injected failure".into(),
            });
        }
        state.endpoints.insert(endpoint.to_string());
        Ok(())
    }

    fn create_link(&mut self, link: &Link) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(BackendCall::CreateLink {
            a: link.a_interface.clone(),
            b: link.b_interface.clone(),
        });
        if state.fail_links.contains(&link.a_interface) {
            return Err(Error::ResourceAllocation {
                resource: format!("link {} <-> {}", link.a_interface, link.b_interface),
                reason: "injected failure".into(),
            });
        }
        let ordinal = state.interfaces.len() + 1;
        for (offset, (endpoint, name, peer)) in [
            (&link.a, &link.a_interface, &link.b_interface),
            (&link.b, &link.b_interface, &link.a_interface),
        ]
        .into_iter()
        .enumerate()
        {
            let mut addresses = BTreeSet::new();
            addresses.insert(format!("fe80::{:x}/64", ordinal + offset));
            state.interfaces.insert(
                name.clone(),
                SimInterface {
                    endpoint: endpoint.clone(),
                    peer: peer.clone(),
                    offloads: SIMULATED_OFFLOADS
                        .iter()
                        .map(|f| (f.to_string(), true))
                        .collect(),
                    addresses,
                    qdisc: None,
                },
            );
        }
        Ok(())
    }

    fn exec(&mut self, endpoint: &str, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let mut state = self.lock();
        let command = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        state.calls.push(BackendCall::Exec {
            endpoint: endpoint.to_string(),
            command: command.clone(),
        });
        if !state.endpoints.contains(endpoint) {
            return Ok(failure(255, &format!("Cannot open network namespace \"{endpoint}\"")));
        }
        if state.fail_commands.iter().any(|p| command.starts_with(p.as_str())) {
            return Ok(failure(2, "injected failure"));
        }
        Ok(simulate(&mut state, endpoint, program, args))
    }

    fn spawn(&mut self, endpoint: &str, request: &SpawnRequest) -> Result<Spawned> {
        let mut state = self.lock();
        state.calls.push(BackendCall::Spawn {
            endpoint: endpoint.to_string(),
            program: request.program.clone(),
            args: request.args.clone(),
        });
        state.requests.push(request.clone());
        if state.fail_spawns.contains(&request.program) || !state.endpoints.contains(endpoint) {
            return Err(Error::Spawn {
                endpoint: endpoint.to_string(),
                label: request.program.clone(),
                reason: "injected failure".into(),
            });
        }

        // Redirect targets are created on spawn, like a real shell would.
        let exit_text = state.exit_on_spawn.get(&request.program).cloned();
        let banner = exit_text
            .clone()
            .or_else(|| state.banners.get(&request.program).cloned());
        for (redirect, text) in [(&request.stdout, None), (&request.stderr, banner.as_deref())] {
            if let Redirect::File(path) = redirect {
                std::fs::write(path, text.unwrap_or(""))?;
            }
        }

        state.next_id += 1;
        let id = ProcessId(state.next_id);
        state.processes.insert(
            id,
            SimProcess {
                endpoint: endpoint.to_string(),
                program: request.program.clone(),
                alive: exit_text.is_none(),
            },
        );
        Ok(Spawned { id, pid: None })
    }

    fn process_alive(&mut self, id: ProcessId) -> bool {
        self.lock().processes.get(&id).is_some_and(|p| p.alive)
    }

    fn terminate(&mut self, id: ProcessId, _grace: Duration) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(BackendCall::Terminate(id));
        let Recorded {
            processes,
            unkillable,
            ..
        } = &mut *state;
        if let Some(p) = processes.get_mut(&id) {
            if !unkillable.contains(&p.program) {
                p.alive = false;
            }
        }
        Ok(())
    }

    fn destroy_endpoint(&mut self, endpoint: &str) -> Result<()> {
        let mut state = self.lock();
        state
            .calls
            .push(BackendCall::DestroyEndpoint(endpoint.to_string()));
        state.endpoints.remove(endpoint);
        let Recorded {
            processes,
            unkillable,
            ..
        } = &mut *state;
        for p in processes.values_mut() {
            if p.endpoint == endpoint && !unkillable.contains(&p.program) {
                p.alive = false;
            }
        }
        // Deleting a namespace takes both ends of its veth pairs with it.
        let doomed: Vec<String> = state
            .interfaces
            .iter()
            .filter(|(_, i)| i.endpoint == endpoint)
            .flat_map(|(name, i)| [name.clone(), i.peer.clone()])
            .collect();
        for name in doomed {
            state.interfaces.remove(&name);
        }
        Ok(())
    }
}

fn success(stdout: String) -> CommandOutput {
    CommandOutput {
        status: Some(0),
        stdout,
        stderr: String::new(),
    }
}

fn failure(status: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        status: Some(status),
        stdout: String::new(),
        stderr: format!("{stderr}\n"),
    }
}

fn no_device(name: &str) -> CommandOutput {
    failure(1, &format!("Cannot find device \"{name}\""))
}

fn lookup<'a>(state: &'a mut Recorded, endpoint: &str, name: &str) -> Option<&'a mut SimInterface> {
    state
        .interfaces
        .get_mut(name)
        .filter(|i| i.endpoint == endpoint)
}

/// Interpret the handful of `ip`, `ethtool` and `tc` invocations the crate
/// issues. Anything else succeeds with no output.
fn simulate(state: &mut Recorded, endpoint: &str, program: &str, args: &[&str]) -> CommandOutput {
    match (program, args) {
        ("ip", ["link", "show", "dev", name]) => match lookup(state, endpoint, name) {
            Some(_) => success(format!("2: {name}@if2: <BROADCAST,MULTICAST,UP> mtu 1500\n")),
            None => failure(1, &format!("Device \"{name}\" does not exist.")),
        },
        ("ip", ["addr", "add", cidr, "dev", name]) => match lookup(state, endpoint, name) {
            Some(iface) => {
                if iface.addresses.insert(cidr.to_string()) {
                    success(String::new())
                } else {
                    failure(2, "RTNETLINK answers: File exists")
                }
            }
            None => no_device(name),
        },
        ("ip", ["addr", "flush", "dev", name]) => match lookup(state, endpoint, name) {
            Some(iface) => {
                iface.addresses.retain(|a| a.contains(':'));
                success(String::new())
            }
            None => no_device(name),
        },
        ("ip", ["-6", "addr", "flush", "dev", name]) => match lookup(state, endpoint, name) {
            Some(iface) => {
                iface.addresses.retain(|a| !a.contains(':'));
                success(String::new())
            }
            None => no_device(name),
        },
        ("ip", ["-o", "addr", "show", "dev", name]) => match lookup(state, endpoint, name) {
            Some(iface) => {
                let out = iface
                    .addresses
                    .iter()
                    .map(|a| {
                        let family = if a.contains(':') { "inet6" } else { "inet" };
                        format!("2: {name}    {family} {a} scope global {name}\\       valid_lft forever\n")
                    })
                    .collect();
                success(out)
            }
            None => no_device(name),
        },
        ("ethtool", ["-K", name, settings @ ..]) => {
            let Some(iface) = lookup(state, endpoint, name) else {
                return no_device(name);
            };
            if settings.is_empty() || settings.len() % 2 != 0 {
                return failure(1, "ethtool: bad command line argument(s)");
            }
            for pair in settings.chunks(2) {
                let on = match pair[1] {
                    "on" => true,
                    "off" => false,
                    _ => return failure(1, "ethtool: bad command line argument(s)"),
                };
                match iface.offloads.get_mut(pair[0]) {
                    Some(value) => *value = on,
                    None => return failure(1, "ethtool: bad command line argument(s)"),
                }
            }
            success(String::new())
        }
        ("tc", ["qdisc", "del", "dev", name, "root"]) => match lookup(state, endpoint, name) {
            Some(iface) => match iface.qdisc.take() {
                Some(_) => success(String::new()),
                None => failure(2, "Error: Cannot delete qdisc with handle of zero."),
            },
            None => no_device(name),
        },
        ("tc", ["qdisc", "add", "dev", name, "root", rest @ ..]) => match lookup(state, endpoint, name) {
            Some(iface) => {
                if iface.qdisc.is_some() {
                    return failure(2, "Error: Exclusivity flag on, cannot modify.");
                }
                iface.qdisc = Some(rest.join(" "));
                success(String::new())
            }
            None => no_device(name),
        },
        _ => success(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{LinkShaping, Topology};

    fn linked() -> RecordingBackend {
        let topo = Topology::builder()
            .endpoint("A")
            .endpoint("B")
            .link("A", "B", LinkShaping::new(1, Duration::from_millis(1)))
            .build()
            .unwrap();
        let mut backend = RecordingBackend::new();
        backend.create_endpoint("A").unwrap();
        backend.create_endpoint("B").unwrap();
        backend.create_link(&topo.links()[0]).unwrap();
        backend
    }

    #[test]
    fn unique_names_fit_and_differ() {
        let a = unique_ns_name("speedlab_test");
        let b = unique_ns_name("speedlab_test");
        assert!(a.len() <= 15 && b.len() <= 15);
        assert_ne!(unique_ns_name("x"), unique_ns_name("x"));
    }

    #[test]
    fn interfaces_are_only_visible_in_their_endpoint() {
        let mut backend = linked();
        assert!(backend
            .exec("A", "ip", &["link", "show", "dev", "A-eth0"])
            .unwrap()
            .success());
        assert!(!backend
            .exec("B", "ip", &["link", "show", "dev", "A-eth0"])
            .unwrap()
            .success());
    }

    #[test]
    fn destroying_one_side_removes_the_veth_pair() {
        let mut backend = linked();
        backend.destroy_endpoint("A").unwrap();
        assert!(backend.live_interfaces().is_empty());
        assert!(backend.endpoint_alive("B"));
    }

    #[test]
    fn injected_command_failure() {
        let mut backend = linked();
        backend.fail_command("tc qdisc add");
        let out = backend
            .exec("A", "tc", &["qdisc", "add", "dev", "A-eth0", "root", "netem"])
            .unwrap();
        assert_eq!(out.status, Some(2));
    }
}
