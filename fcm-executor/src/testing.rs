//! In-memory stand-ins for the host, the VMM and supervisord.
//!
//! [`FakeHost`] emulates the subset of `ip` the allocator uses, answers
//! `supervisorctl` and `resize2fs` with success, and records every
//! invocation. [`FakeVmm`] is both an [`ApiTransport`] and a [`Supervisor`]:
//! starting a program makes its socket answer, stopping it makes it go
//! silent.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use fcm_core::VmName;
use hyper::Method;
use serde_json::Value;

use crate::firecracker::{ApiResponse, ApiTransport};
use crate::host::{CommandOutput, HostCommand, Invocation};
use crate::supervisor::Supervisor;
use crate::ExecutorError;

fn missing(name: &str) -> CommandOutput {
    CommandOutput::failed(1, format!("Device \"{name}\" does not exist.\n"))
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Device {
    up: bool,
    addrs: Vec<Ipv4Addr>,
}

#[derive(Debug, Default)]
struct HostState {
    devices: BTreeMap<String, Device>,
    routes: BTreeMap<Ipv4Addr, String>,
    scripted: Vec<(String, CommandOutput)>,
    log: Vec<Invocation>,
}

/// Emulated host network namespace and tool runner.
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    /// A host that already has `names` (up, without addresses).
    #[must_use]
    pub fn with_devices(names: &[&str]) -> Self {
        let host = Self::default();
        for name in names {
            host.add_device(name, None);
        }
        host
    }

    /// Adds a device, optionally with a `/32` address.
    pub fn add_device(&self, name: &str, addr: Option<Ipv4Addr>) {
        let mut s = guard(&self.state);
        let dev = s.devices.entry(name.to_owned()).or_default();
        dev.up = true;
        dev.addrs.extend(addr);
    }

    /// Adds a `/32` route to `ip` via `device`.
    pub fn add_route(&self, ip: Ipv4Addr, device: &str) {
        guard(&self.state).routes.insert(ip, device.to_owned());
    }

    /// Answers every invocation whose command line starts with `prefix`
    /// with `output` instead of emulating it.
    pub fn script(&self, prefix: &str, output: CommandOutput) {
        guard(&self.state).scripted.push((prefix.to_owned(), output));
    }

    /// Device names, sorted.
    #[must_use]
    pub fn devices(&self) -> Vec<String> {
        guard(&self.state).devices.keys().cloned().collect()
    }

    /// Addresses assigned to `name`.
    #[must_use]
    pub fn addresses(&self, name: &str) -> Vec<Ipv4Addr> {
        guard(&self.state).devices.get(name).map(|d| d.addrs.clone()).unwrap_or_default()
    }

    /// `true` if `name` exists and is up.
    #[must_use]
    pub fn is_up(&self, name: &str) -> bool {
        guard(&self.state).devices.get(name).is_some_and(|d| d.up)
    }

    /// Device the `/32` route to `ip` goes through.
    #[must_use]
    pub fn route(&self, ip: Ipv4Addr) -> Option<String> {
        guard(&self.state).routes.get(&ip).cloned()
    }

    /// Every invocation so far, in order.
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation> {
        guard(&self.state).log.clone()
    }

    /// Privileged invocations so far.
    #[must_use]
    pub fn mutations(&self) -> Vec<Invocation> {
        self.invocations().into_iter().filter(|i| i.privileged).collect()
    }

    /// Number of invocations whose command line starts with `prefix`.
    #[must_use]
    pub fn count(&self, prefix: &str) -> usize {
        guard(&self.state)
            .log
            .iter()
            .filter(|i| i.to_string().starts_with(prefix))
            .count()
    }

    fn link_line(index: usize, name: &str, dev: &Device) -> String {
        let state = if dev.up { "UP" } else { "DOWN" };
        format!(
            "{}: {name}: <BROADCAST,MULTICAST,{state}> mtu 1500 qdisc fq_codel state {state} mode DEFAULT group default qlen 1000\n",
            index + 2
        )
    }

    fn emulate_ip(s: &mut HostState, args: &[&str]) -> CommandOutput {
        match args {
            ["-o", "link", "show"] => {
                let mut out = String::from(
                    "1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN mode DEFAULT group default qlen 1000\n",
                );
                for (i, (name, dev)) in s.devices.iter().enumerate() {
                    out.push_str(&Self::link_line(i, name, dev));
                }
                CommandOutput::ok(out)
            }
            ["link", "show", name] => match s.devices.iter().enumerate().find(|(_, (n, _))| n == name) {
                Some((i, (n, dev))) => CommandOutput::ok(Self::link_line(i, n, dev)),
                None => missing(name),
            },
            ["tuntap", "add", name, "mode", "tap"] => {
                if s.devices.contains_key(*name) {
                    return CommandOutput::failed(1, "ioctl(TUNSETIFF): Device or resource busy\n");
                }
                s.devices.insert((*name).to_owned(), Device::default());
                CommandOutput::ok("")
            }
            ["link", "set", name, "up"] => match s.devices.get_mut(*name) {
                Some(dev) => {
                    dev.up = true;
                    CommandOutput::ok("")
                }
                None => missing(name),
            },
            ["link", "del", name] => {
                if s.devices.remove(*name).is_none() {
                    return CommandOutput::failed(1, format!("Cannot find device \"{name}\"\n"));
                }
                s.routes.retain(|_, dev| dev.as_str() != *name);
                CommandOutput::ok("")
            }
            ["addr", "show", "dev", name] => match s.devices.get(*name) {
                Some(dev) => {
                    let mut out = format!("3: {name}: <BROADCAST,MULTICAST,UP> mtu 1500\n");
                    for ip in &dev.addrs {
                        out.push_str(&format!("    inet {ip}/32 scope global {name}\n       valid_lft forever preferred_lft forever\n"));
                    }
                    CommandOutput::ok(out)
                }
                None => missing(name),
            },
            ["addr", "add", cidr, "dev", name] => {
                let Some(ip) = cidr.split('/').next().and_then(|ip| ip.parse::<Ipv4Addr>().ok()) else {
                    return CommandOutput::failed(1, format!("Error: inet prefix is expected rather than \"{cidr}\".\n"));
                };
                match s.devices.get_mut(*name) {
                    Some(dev) if dev.addrs.contains(&ip) => CommandOutput::failed(2, "RTNETLINK answers: File exists\n"),
                    Some(dev) => {
                        dev.addrs.push(ip);
                        CommandOutput::ok("")
                    }
                    None => missing(name),
                }
            }
            ["route", "show", cidr] => {
                let ip = cidr.split('/').next().and_then(|ip| ip.parse::<Ipv4Addr>().ok());
                match ip.and_then(|ip| s.routes.get(&ip).map(|dev| (ip, dev))) {
                    Some((ip, dev)) => CommandOutput::ok(format!("{ip} dev {dev} scope link \n")),
                    None => CommandOutput::ok(""),
                }
            }
            ["route", "add", cidr, "dev", name] => {
                let Some(ip) = cidr.split('/').next().and_then(|ip| ip.parse::<Ipv4Addr>().ok()) else {
                    return CommandOutput::failed(1, "Error: any valid prefix is expected.\n");
                };
                if !s.devices.contains_key(*name) {
                    return CommandOutput::failed(1, "Cannot find device\n");
                }
                if s.routes.contains_key(&ip) {
                    return CommandOutput::failed(2, "RTNETLINK answers: File exists\n");
                }
                s.routes.insert(ip, (*name).to_owned());
                CommandOutput::ok("")
            }
            ["route", "get", target] => {
                let route = target.parse::<Ipv4Addr>().ok().and_then(|ip| s.routes.get(&ip).map(|d| (ip, d)));
                match route {
                    Some((ip, dev)) => CommandOutput::ok(format!("{ip} dev {dev} src 0.0.0.0 uid 0 \n    cache \n")),
                    None => CommandOutput::failed(2, "RTNETLINK answers: Network is unreachable\n"),
                }
            }
            _ => CommandOutput::failed(1, format!("unsupported ip invocation: {args:?}\n")),
        }
    }
}

#[async_trait]
impl HostCommand for FakeHost {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, ExecutorError> {
        let mut s = guard(&self.state);
        s.log.push(invocation.clone());
        let line = invocation.to_string();
        if let Some((_, output)) = s.scripted.iter().find(|(prefix, _)| line.starts_with(prefix.as_str())) {
            return Ok(output.clone());
        }
        let args: Vec<&str> = invocation.args.iter().map(String::as_str).collect();
        let output = match invocation.program.as_str() {
            "ip" => Self::emulate_ip(&mut s, &args),
            "supervisorctl" => match args.as_slice() {
                ["stop", name] => CommandOutput::ok(format!("{name}: stopped\n")),
                ["start", name] => CommandOutput::ok(format!("{name}: started\n")),
                _ => CommandOutput::ok(""),
            },
            "resize2fs" => CommandOutput::ok("Resizing the filesystem\n"),
            other => CommandOutput::failed(127, format!("{other}: command not found\n")),
        };
        Ok(output)
    }
}

#[derive(Debug, Default)]
struct Machine {
    puts: Vec<(String, Value)>,
    started: bool,
}

#[derive(Debug, Default)]
struct VmmState {
    programs: BTreeMap<String, PathBuf>,
    running: BTreeSet<PathBuf>,
    machines: BTreeMap<PathBuf, Machine>,
    rejected: Option<(String, String)>,
    failing_start: BTreeSet<String>,
    failing_stop: BTreeSet<String>,
    silent: BTreeSet<String>,
    supervisor_log: Vec<String>,
}

/// Emulated Firecracker processes managed by an emulated supervisord.
#[derive(Debug, Clone, Default)]
pub struct FakeVmm {
    state: Arc<Mutex<VmmState>>,
}

impl FakeVmm {
    /// Makes a VMM answer on `socket` without going through the supervisor.
    pub fn boot_socket(&self, socket: impl Into<PathBuf>) {
        let socket = socket.into();
        let mut s = guard(&self.state);
        s.machines.insert(socket.clone(), Machine::default());
        s.running.insert(socket);
    }

    /// Every VMM rejects PUT `/<step>` with HTTP 400 and `fault`.
    pub fn reject_step(&self, step: &str, fault: &str) {
        guard(&self.state).rejected = Some((format!("/{step}"), fault.to_owned()));
    }

    /// Clears a rejection set by [`Self::reject_step`].
    pub fn accept_all(&self) {
        guard(&self.state).rejected = None;
    }

    /// `supervisorctl start <name>` fails.
    pub fn fail_start(&self, name: &str) {
        guard(&self.state).failing_start.insert(name.to_owned());
    }

    /// `supervisorctl stop <name>` fails and leaves the VMM running.
    pub fn fail_stop(&self, name: &str) {
        guard(&self.state).failing_stop.insert(name.to_owned());
    }

    /// The program for `name` starts but its socket never answers.
    pub fn never_ready(&self, name: &str) {
        guard(&self.state).silent.insert(name.to_owned());
    }

    /// `true` if a registered program exists for `name`.
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        guard(&self.state).programs.contains_key(name)
    }

    /// `true` if a VMM answers on `socket`.
    #[must_use]
    pub fn is_running(&self, socket: &Path) -> bool {
        guard(&self.state).running.contains(socket)
    }

    /// `true` if the guest behind `socket` was booted.
    #[must_use]
    pub fn is_started(&self, socket: &Path) -> bool {
        guard(&self.state).machines.get(socket).is_some_and(|m| m.started)
    }

    /// Paths of the PUT requests the VMM on `socket` accepted or rejected, in order.
    #[must_use]
    pub fn put_paths(&self, socket: impl AsRef<Path>) -> Vec<String> {
        guard(&self.state)
            .machines
            .get(socket.as_ref())
            .map(|m| m.puts.iter().map(|(p, _)| p.clone()).collect())
            .unwrap_or_default()
    }

    /// Body of the last PUT to `path` on `socket`, or `Null`.
    #[must_use]
    pub fn put_body(&self, socket: impl AsRef<Path>, path: &str) -> Value {
        guard(&self.state)
            .machines
            .get(socket.as_ref())
            .and_then(|m| m.puts.iter().rev().find(|(p, _)| p == path).map(|(_, b)| b.clone()))
            .unwrap_or(Value::Null)
    }

    /// Supervisor actions so far, as `"<verb> <name>"`.
    #[must_use]
    pub fn supervisor_log(&self) -> Vec<String> {
        guard(&self.state).supervisor_log.clone()
    }

    fn vm_config(machine: &Machine) -> Value {
        let last = |path: &str| {
            machine.puts.iter().rev().find(|(p, _)| p == path).map(|(_, b)| b.clone())
        };
        let drives: Vec<Value> = last("/drives/rootfs").into_iter().collect();
        let ifaces: Vec<Value> = ["/network-interfaces/eth0", "/network-interfaces/mmds0"]
            .iter()
            .filter_map(|p| last(*p))
            .collect();
        serde_json::json!({
            "machine-config": last("/machine-config"),
            "boot-source": last("/boot-source"),
            "drives": drives,
            "network-interfaces": ifaces,
        })
    }
}

fn respond(status: u16, body: impl Into<String>) -> Result<ApiResponse, ExecutorError> {
    Ok(ApiResponse { status, body: body.into() })
}

#[async_trait]
impl ApiTransport for FakeVmm {
    async fn request(
        &self,
        socket: &Path,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<ApiResponse, ExecutorError> {
        let mut s = guard(&self.state);
        if !s.running.contains(socket) {
            return Err(ExecutorError::tool(
                "firecracker API",
                format!("connect to {}: Connection refused", socket.display()),
            ));
        }
        let rejected = s.rejected.clone();
        let Some(machine) = s.machines.get_mut(socket) else {
            return respond(500, r#"{"fault_message":"no machine"}"#);
        };

        if method == Method::GET {
            return match path {
                "/" => respond(200, r#"{"id":"anonymous-instance","state":"Not started"}"#),
                "/vm/config" => respond(200, Self::vm_config(machine).to_string()),
                "/mmds" => {
                    let doc = machine
                        .puts
                        .iter()
                        .rev()
                        .find(|(p, _)| p == "/mmds")
                        .map_or_else(|| Value::Object(serde_json::Map::new()), |(_, b)| b.clone());
                    respond(200, doc.to_string())
                }
                _ => respond(400, r#"{"fault_message":"Invalid request method and/or path"}"#),
            };
        }

        let value: Value = body
            .as_deref()
            .and_then(|b| serde_json::from_str(b).ok())
            .unwrap_or(Value::Null);
        machine.puts.push((path.to_owned(), value));

        if let Some((step, fault)) = rejected {
            if step == path {
                return respond(400, serde_json::json!({ "fault_message": fault }).to_string());
            }
        }
        if path == "/actions" {
            machine.started = true;
        }
        respond(204, "")
    }
}

#[async_trait]
impl Supervisor for FakeVmm {
    async fn ensure_registered(&self, name: &VmName, socket: &Path) -> Result<bool, ExecutorError> {
        let mut s = guard(&self.state);
        s.supervisor_log.push(format!("register {name}"));
        let previous = s.programs.insert(name.to_string(), socket.to_path_buf());
        Ok(previous.as_deref() != Some(socket))
    }

    async fn start(&self, name: &VmName) -> Result<(), ExecutorError> {
        let mut s = guard(&self.state);
        s.supervisor_log.push(format!("start {name}"));
        if s.failing_start.contains(name.as_str()) {
            return Err(ExecutorError::tool("supervisorctl", format!("{name}: ERROR (spawn error)")));
        }
        let Some(socket) = s.programs.get(name.as_str()).cloned() else {
            return Err(ExecutorError::tool("supervisorctl", format!("{name}: ERROR (no such process)")));
        };
        if s.silent.contains(name.as_str()) || s.running.contains(&socket) {
            return Ok(());
        }
        s.machines.insert(socket.clone(), Machine::default());
        s.running.insert(socket);
        Ok(())
    }

    async fn stop(&self, name: &VmName) -> Result<(), ExecutorError> {
        let mut s = guard(&self.state);
        s.supervisor_log.push(format!("stop {name}"));
        if s.failing_stop.contains(name.as_str()) {
            return Err(ExecutorError::tool("supervisorctl", format!("{name}: ERROR (abnormal termination)")));
        }
        if let Some(socket) = s.programs.get(name.as_str()).cloned() {
            s.running.remove(&socket);
            s.machines.remove(&socket);
        }
        Ok(())
    }

    async fn unregister(&self, name: &VmName) -> Result<bool, ExecutorError> {
        let mut s = guard(&self.state);
        s.supervisor_log.push(format!("unregister {name}"));
        let removed = s.programs.remove(name.as_str());
        if let Some(socket) = &removed {
            s.running.remove(socket);
            s.machines.remove(socket);
        }
        Ok(removed.is_some())
    }
}
