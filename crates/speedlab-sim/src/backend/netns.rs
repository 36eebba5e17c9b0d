use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use super::{Backend, CommandOutput, ProcessId, Redirect, SpawnRequest, Spawned};
use crate::error::{Error, Result};
use crate::topology::Link;

/// Backend built on Linux network namespaces managed via `ip netns`.
///
/// Each endpoint becomes a namespace named `<prefix><endpoint>`, links are
/// veth pairs moved into the two namespaces. Commands go through
/// `ip netns exec`, optionally wrapped in `sudo -n`.
pub struct NetnsBackend {
    prefix: String,
    use_sudo: bool,
    namespaces: BTreeSet<String>,
    children: HashMap<ProcessId, Running>,
    next_id: u64,
}

/// A spawned process. Kept after it exits so liveness can still be asked
/// about; `descendants` holds what the wrapper (`sudo`, `ip netns exec`)
/// started, since killing the wrapper does not reach them.
struct Running {
    endpoint: String,
    child: Child,
    reaped: bool,
    descendants: Vec<u32>,
}

impl Running {
    /// Reap the wrapper if it has exited. `true` while it is running.
    fn wrapper_running(&mut self) -> bool {
        if self.reaped {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(_)) => {
                self.reaped = true;
                false
            }
            Ok(None) => true,
            // Cannot tell; treat as running.
            Err(_) => true,
        }
    }

    fn refresh_descendants(&mut self) {
        for pid in descendants(self.child.id()) {
            if !self.descendants.contains(&pid) {
                self.descendants.push(pid);
            }
        }
    }

    fn surviving_descendants(&self) -> Vec<u32> {
        self.descendants
            .iter()
            .copied()
            .filter(|pid| pid_alive(*pid))
            .collect()
    }
}

impl NetnsBackend {
    pub fn new(prefix: impl Into<String>, use_sudo: bool) -> Self {
        Self {
            prefix: prefix.into(),
            use_sudo,
            namespaces: BTreeSet::new(),
            children: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn namespace_name(&self, endpoint: &str) -> String {
        format!("{}{}", self.prefix, endpoint)
    }

    /// Delete leftover namespaces for `endpoints`, e.g. after a crashed
    /// run. Returns the namespaces that existed and were removed.
    pub fn cleanup<'a, I>(&mut self, endpoints: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let existing = self.list_namespaces()?;
        let mut removed = Vec::new();
        for endpoint in endpoints {
            let ns = self.namespace_name(endpoint);
            if existing.contains(&ns) {
                self.namespaces.insert(ns.clone());
                self.destroy_endpoint(endpoint)?;
                removed.push(ns);
            }
        }
        Ok(removed)
    }

    fn list_namespaces(&self) -> Result<BTreeSet<String>> {
        let output = self.host(&["ip", "netns", "list"]).output()?;
        if !output.status.success() {
            return Err(command_failed("host", "ip netns list", output.into()));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    /// A command run in the host namespace.
    fn host(&self, argv: &[&str]) -> Command {
        let mut cmd = if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(argv[0]);
            cmd
        } else {
            Command::new(argv[0])
        };
        cmd.args(&argv[1..]);
        cmd
    }

    /// A command run inside the namespace of `endpoint`.
    fn in_namespace(&self, endpoint: &str, program: &str) -> Command {
        let ns = self.namespace_name(endpoint);
        let mut cmd = self.host(&["ip", "netns", "exec", &ns]);
        cmd.arg(program);
        cmd
    }

    fn host_checked(&self, resource: &str, argv: &[&str]) -> Result<()> {
        let output = self
            .host(argv)
            .output()
            .map_err(|e| allocation(resource, e.to_string()))?;
        if !output.status.success() {
            return Err(allocation(
                resource,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    fn ns_checked(&mut self, endpoint: &str, resource: &str, argv: &[&str]) -> Result<()> {
        let output = self.exec(endpoint, argv[0], &argv[1..])?;
        if !output.success() {
            return Err(allocation(resource, output.stderr.trim().to_string()));
        }
        Ok(())
    }

    fn place_link_ends(&mut self, link: &Link, resource: &str) -> Result<()> {
        for (endpoint, iface) in [(&link.a, &link.a_interface), (&link.b, &link.b_interface)] {
            let ns = self.namespace_name(endpoint);
            self.host_checked(resource, &["ip", "link", "set", iface, "netns", &ns])?;
            self.ns_checked(endpoint, resource, &["ip", "link", "set", iface, "up"])?;
        }
        Ok(())
    }

    fn kill_pids(&self, pids: &[u32]) {
        if pids.is_empty() {
            return;
        }
        let pids: Vec<String> = pids.iter().map(u32::to_string).collect();
        let mut argv = vec!["kill", "-KILL"];
        argv.extend(pids.iter().map(String::as_str));
        let _ = self.host(&argv).status();
    }

    /// Kill whatever is still attached to the namespace.
    fn kill_namespace_pids(&self, ns: &str) {
        let output = match self.host(&["ip", "netns", "pids", ns]).output() {
            Ok(o) if o.status.success() => o,
            _ => return,
        };
        let pids: Vec<u32> = String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .filter_map(|p| p.parse().ok())
            .collect();
        if !pids.is_empty() {
            tracing::debug!(namespace = ns, count = pids.len(), "killing leftover processes");
            self.kill_pids(&pids);
        }
    }
}

impl Backend for NetnsBackend {
    fn create_endpoint(&mut self, endpoint: &str) -> Result<()> {
        let ns = self.namespace_name(endpoint);

        // A crashed run may have left one behind.
        let _ = self.host(&["ip", "netns", "del", &ns]).output();

        self.host_checked(&format!("namespace {ns}"), &["ip", "netns", "add", &ns])?;
        self.namespaces.insert(ns.clone());

        self.ns_checked(
            endpoint,
            &format!("loopback in {ns}"),
            &["ip", "link", "set", "lo", "up"],
        )?;
        tracing::debug!(endpoint, namespace = %ns, "endpoint created");
        Ok(())
    }

    fn create_link(&mut self, link: &Link) -> Result<()> {
        let resource = format!("link {} <-> {}", link.a_interface, link.b_interface);

        // Stale root-namespace end from an earlier run.
        let _ = self.host(&["ip", "link", "del", &link.a_interface]).output();

        self.host_checked(
            &resource,
            &[
                "ip",
                "link",
                "add",
                &link.a_interface,
                "type",
                "veth",
                "peer",
                "name",
                &link.b_interface,
            ],
        )?;

        if let Err(err) = self.place_link_ends(link, &resource) {
            // Namespace teardown never sees an end still in the root
            // namespace. Deleting either end removes the pair.
            for iface in [&link.a_interface, &link.b_interface] {
                let _ = self.host(&["ip", "link", "del", iface]).output();
            }
            return Err(err);
        }

        tracing::debug!(
            a = %link.a_interface,
            b = %link.b_interface,
            "veth link created"
        );
        Ok(())
    }

    fn exec(&mut self, endpoint: &str, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = self.in_namespace(endpoint, program).args(args).output()?;
        Ok(output.into())
    }

    fn spawn(&mut self, endpoint: &str, request: &SpawnRequest) -> Result<Spawned> {
        let spawn_error = |reason: String| Error::Spawn {
            endpoint: endpoint.to_string(),
            label: request.program.clone(),
            reason,
        };

        let mut cmd = self.in_namespace(endpoint, &request.program);
        cmd.args(&request.args)
            .stdin(Stdio::null())
            .stdout(open_redirect(&request.stdout).map_err(|e| spawn_error(e.to_string()))?)
            .stderr(open_redirect(&request.stderr).map_err(|e| spawn_error(e.to_string()))?)
            // Terminal Ctrl-C goes to the controller only.
            .process_group(0);
        if let Some(dir) = &request.workdir {
            cmd.current_dir(dir);
        }

        tracing::debug!(endpoint, cmd = ?cmd, "spawning background process");
        let child = cmd.spawn().map_err(|e| spawn_error(e.to_string()))?;
        let pid = child.id();

        self.next_id += 1;
        let id = ProcessId(self.next_id);
        self.children.insert(
            id,
            Running {
                endpoint: endpoint.to_string(),
                child,
                reaped: false,
                descendants: Vec::new(),
            },
        );
        Ok(Spawned { id, pid: Some(pid) })
    }

    fn process_alive(&mut self, id: ProcessId) -> bool {
        let Some(running) = self.children.get_mut(&id) else {
            return false;
        };
        if running.wrapper_running() {
            running.refresh_descendants();
            return true;
        }
        !running.surviving_descendants().is_empty()
    }

    fn terminate(&mut self, id: ProcessId, grace: Duration) -> Result<()> {
        let Some(mut running) = self.children.remove(&id) else {
            return Ok(());
        };

        if running.wrapper_running() {
            running.refresh_descendants();
            let pid = running.child.id() as libc::pid_t;
            // SAFETY: `pid` belongs to a child we have not reaped yet, so it
            // cannot have been recycled. A stale pid makes kill return ESRCH.
            unsafe {
                libc::kill(pid, libc::SIGINT);
            }

            match wait_with_timeout(&mut running.child, grace) {
                Ok(()) => tracing::debug!(%id, endpoint = %running.endpoint, "process exited"),
                Err(_) => {
                    tracing::warn!(
                        %id,
                        endpoint = %running.endpoint,
                        "process ignored SIGINT, killing"
                    );
                    self.kill_pids(&running.surviving_descendants());
                    let _ = running.child.kill();
                    let _ = running.child.wait();
                }
            }
            running.reaped = true;
        }

        let survivors = running.surviving_descendants();
        if !survivors.is_empty() {
            tracing::warn!(%id, pids = ?survivors, "killing processes left behind by wrapper");
            self.kill_pids(&survivors);
        }
        self.children.insert(id, running);
        Ok(())
    }

    fn destroy_endpoint(&mut self, endpoint: &str) -> Result<()> {
        let ns = self.namespace_name(endpoint);

        let ids: Vec<ProcessId> = self
            .children
            .iter()
            .filter(|(_, r)| r.endpoint == endpoint)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.terminate(id, Duration::ZERO)?;
        }

        if !self.namespaces.remove(&ns) {
            return Ok(());
        }
        self.kill_namespace_pids(&ns);

        let output = self.host(&["ip", "netns", "del", &ns]).output()?;
        if !output.status.success() {
            return Err(command_failed(
                endpoint,
                &format!("ip netns del {ns}"),
                output.into(),
            ));
        }
        tracing::debug!(endpoint, namespace = %ns, "endpoint destroyed");
        Ok(())
    }
}

/// Whether `pid` exists and is not a zombie.
fn pid_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat_fields(&stat).is_some_and(|(state, _)| state != "Z"),
        Err(_) => false,
    }
}

/// State and parent pid from a `/proc/<pid>/stat` line. The command name
/// may contain spaces, so fields are read after its closing parenthesis.
fn stat_fields(stat: &str) -> Option<(&str, u32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

/// Every process below `root` in the process tree.
fn descendants(root: u32) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut parents: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some((_, ppid)) = stat_fields(&stat) {
            parents.entry(ppid).or_default().push(pid);
        }
    }

    let mut found = Vec::new();
    let mut queue = vec![root];
    while let Some(pid) = queue.pop() {
        if let Some(children) = parents.get(&pid) {
            for &child in children {
                if !found.contains(&child) {
                    found.push(child);
                    queue.push(child);
                }
            }
        }
    }
    found
}

fn open_redirect(redirect: &Redirect) -> std::io::Result<Stdio> {
    match redirect {
        Redirect::Null => Ok(Stdio::null()),
        Redirect::File(path) => Ok(File::create(path)?.into()),
    }
}

fn allocation(resource: &str, reason: String) -> Error {
    Error::ResourceAllocation {
        resource: resource.to_string(),
        reason,
    }
}

fn command_failed(endpoint: &str, command: &str, output: CommandOutput) -> Error {
    Error::CommandExecution {
        endpoint: endpoint.to_string(),
        command: command.to_string(),
        status: output.status,
        stderr: output.stderr,
    }
}

/// Poll `child` until it exits or `timeout` passes.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait()? {
            Some(_status) => return Ok(()),
            None => {
                if Instant::now() >= deadline {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "timeout waiting for child process",
                    ));
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{check_privileges, unique_ns_name};
    use crate::topology::{LinkShaping, Topology};

    #[test]
    fn namespace_name_uses_prefix() {
        let backend = NetnsBackend::new("speedlab-", false);
        assert_eq!(backend.namespace_name("left_h"), "speedlab-left_h");
    }

    #[test]
    fn sudo_wraps_host_commands() {
        let backend = NetnsBackend::new("p-", true);
        let cmd = backend.in_namespace("A", "ethtool");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.get_program(), "sudo");
        assert_eq!(args, ["-n", "ip", "netns", "exec", "p-A", "ethtool"]);
    }

    #[test]
    fn stat_fields_skip_command_names_with_spaces() {
        let stat = "4242 (tcp dump) (x)) S 17 4242 4242 0 -1 4194560";
        assert_eq!(stat_fields(stat), Some(("S", 17)));
        assert_eq!(stat_fields("garbage"), None);
    }

    #[test]
    fn own_process_tree_is_visible() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 30 & wait"])
            .spawn()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut below = descendants(child.id());
        while below.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
            below = descendants(child.id());
        }
        assert!(pid_alive(child.id()));
        assert_eq!(below.len(), 1, "{below:?}");

        for pid in &below {
            Command::new("kill").arg(pid.to_string()).status().unwrap();
        }
        child.wait().unwrap();
        assert!(!pid_alive(child.id()));
    }

    #[test]
    fn terminated_process_is_not_reported_alive() {
        if !check_privileges() {
            eprintln!("Skipping test, insufficient privileges or missing tools");
            return;
        }
        let prefix = unique_ns_name("slt");
        let mut backend = NetnsBackend::new(format!("{prefix}_"), true);
        backend.create_endpoint("t").unwrap();

        let spawned = backend
            .spawn("t", &SpawnRequest::new("sleep").args(["600"]))
            .unwrap();
        assert!(backend.process_alive(spawned.id));

        backend.terminate(spawned.id, Duration::from_secs(2)).unwrap();
        assert!(!backend.process_alive(spawned.id));
        backend.destroy_endpoint("t").unwrap();
    }

    #[test]
    fn failed_link_placement_leaves_no_veth_in_host() {
        if !check_privileges() {
            eprintln!("Skipping test, insufficient privileges or missing tools");
            return;
        }
        let prefix = unique_ns_name("slv");
        let mut backend = NetnsBackend::new(format!("{prefix}_"), true);
        let topo = Topology::builder()
            .endpoint("va")
            .endpoint("vb")
            .link("va", "vb", LinkShaping::new(10, Duration::from_millis(1)))
            .build()
            .unwrap();

        // `vb` has no namespace, so moving its end fails after `ip link add`.
        backend.create_endpoint("va").unwrap();
        let err = backend.create_link(&topo.links()[0]).unwrap_err();
        assert!(matches!(err, Error::ResourceAllocation { .. }), "{err}");

        let host_peer = backend
            .host(&["ip", "link", "show", "dev", "vb-eth0"])
            .output()
            .unwrap();
        assert!(!host_peer.status.success(), "vb-eth0 left in the root namespace");
        let moved_end = backend
            .exec("va", "ip", &["link", "show", "dev", "va-eth0"])
            .unwrap();
        assert!(!moved_end.success(), "va-eth0 outlived its peer");

        backend.destroy_endpoint("va").unwrap();
    }

    #[test]
    fn test_create_endpoint_pair_and_link() {
        if !check_privileges() {
            eprintln!("Skipping test, insufficient privileges or missing tools");
            return;
        }

        let prefix = unique_ns_name("sl");
        let mut backend = NetnsBackend::new(format!("{prefix}_"), true);
        let topo = Topology::builder()
            .endpoint("a")
            .endpoint("b")
            .link("a", "b", LinkShaping::new(10, Duration::from_millis(1)))
            .build()
            .unwrap();

        backend.create_endpoint("a").expect("Failed to create a");
        backend.create_endpoint("b").expect("Failed to create b");
        backend
            .create_link(&topo.links()[0])
            .expect("Failed to create link");

        let out = backend
            .exec("a", "ip", &["link", "show", "dev", "a-eth0"])
            .expect("Failed to exec ip link");
        assert!(out.success(), "{}", out.stderr);

        backend.destroy_endpoint("a").unwrap();
        backend.destroy_endpoint("b").unwrap();
        assert!(!backend
            .list_namespaces()
            .unwrap()
            .contains(&backend.namespace_name("a")));
    }
}
