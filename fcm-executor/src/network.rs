//! TAP device allocation and host network provisioning.
//!
//! All host interaction goes through `ip` (iproute2) via [`HostCommand`].
//! Mutating commands are marked privileged.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::host::{HostCommand, Invocation};
use crate::ExecutorError;

/// Result of removing a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// The device existed and was deleted.
    Removed,
    /// The device was already gone.
    Absent,
}

/// Extracts interface names from `ip link show` or `ip -o link show` output.
///
/// Only header lines (`<index>: <name>: <flags> ...`) are considered. A
/// `@<peer>` suffix (veth, vlan) is stripped.
#[must_use]
pub fn parse_link_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.starts_with(|c: char| c.is_ascii_digit()))
        .filter_map(|line| {
            let mut fields = line.splitn(3, ": ");
            fields.next()?;
            let name = fields.next()?.trim();
            let name = name.split('@').next().unwrap_or(name);
            (!name.is_empty()).then(|| name.to_owned())
        })
        .collect()
}

/// Extracts IPv4 addresses with prefix length from `ip addr show` output.
#[must_use]
pub fn parse_inet_addrs(output: &str) -> Vec<(Ipv4Addr, u8)> {
    let mut addrs = Vec::new();
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token != "inet" {
            continue;
        }
        let Some(cidr) = tokens.next() else { break };
        let (ip, prefix) = cidr.split_once('/').unwrap_or((cidr, "32"));
        let prefix = prefix.parse::<u8>().ok().filter(|p| *p <= 32);
        if let (Ok(ip), Some(prefix)) = (ip.parse::<Ipv4Addr>(), prefix) {
            addrs.push((ip, prefix));
        }
    }
    addrs
}

/// Returns the numeric suffix of `name` if it is `<prefix><digits>`.
#[must_use]
pub fn tap_index(name: &str, prefix: &str) -> Option<u32> {
    let digits = name.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Allocates TAP device names and provisions the devices on the host.
///
/// The allocator remembers every name it handed out for as long as it
/// lives, so a name is never handed out twice by the same allocator, whether
/// or not the device currently exists on the host.
pub struct TapAllocator<H: HostCommand> {
    host: Arc<H>,
    prefix: String,
    claimed: Mutex<BTreeSet<String>>,
}

impl<H: HostCommand> TapAllocator<H> {
    /// Creates an allocator generating names `<prefix>0`, `<prefix>1`, ...
    #[must_use]
    pub fn new(host: Arc<H>, prefix: impl Into<String>) -> Self {
        Self { host, prefix: prefix.into(), claimed: Mutex::new(BTreeSet::new()) }
    }

    /// Returns `true` if this allocator handed out `name`.
    pub async fn is_claimed(&self, name: &str) -> bool {
        self.claimed.lock().await.contains(name)
    }

    /// Produces the primary and MMDS device names for one VM.
    ///
    /// Explicit names are checked against the host, the claimed set and
    /// `recorded` (devices named by existing VM records, which may be absent
    /// from the host while their VM is stopped). Missing names are generated
    /// as the lowest `<prefix><n>` free in all three. Both names are claimed
    /// before returning.
    ///
    /// # Errors
    /// - [`ExecutorError::Validation`] if both explicit names are equal
    /// - [`ExecutorError::ResourceConflict`] if an explicit name is taken
    /// - [`ExecutorError::ExternalTool`] if the host scan fails
    pub async fn allocate(
        &self,
        primary: Option<&str>,
        mmds: Option<&str>,
        recorded: &BTreeSet<String>,
    ) -> Result<(String, String), ExecutorError> {
        if let (Some(p), Some(m)) = (primary, mmds) {
            if p == m {
                return Err(ExecutorError::Validation(format!(
                    "primary and MMDS device are both '{p}'; they must differ"
                )));
            }
        }

        let mut claimed = self.claimed.lock().await;
        let on_host = self.host_devices().await?;

        for name in [primary, mmds].into_iter().flatten() {
            if on_host.contains(name) {
                return Err(ExecutorError::conflict(format!("TAP device '{name}'"), "exists on the host"));
            }
            if claimed.contains(name) {
                return Err(ExecutorError::conflict(
                    format!("TAP device '{name}'"),
                    "already allocated to another VM",
                ));
            }
            if recorded.contains(name) {
                return Err(ExecutorError::conflict(
                    format!("TAP device '{name}'"),
                    "named in the record of another VM",
                ));
            }
        }
        for name in [primary, mmds].into_iter().flatten() {
            claimed.insert(name.to_owned());
        }

        let taken: BTreeSet<String> = on_host.union(recorded).cloned().collect();
        let primary = match primary {
            Some(p) => p.to_owned(),
            None => self.claim_next(&taken, &mut claimed),
        };
        let mmds = match mmds {
            Some(m) => m.to_owned(),
            None => self.claim_next(&taken, &mut claimed),
        };

        tracing::debug!(primary = %primary, mmds = %mmds, "allocated TAP devices");
        Ok((primary, mmds))
    }

    fn claim_next(&self, taken: &BTreeSet<String>, claimed: &mut BTreeSet<String>) -> String {
        let used: BTreeSet<u32> = taken
            .iter()
            .chain(claimed.iter())
            .filter_map(|name| tap_index(name, &self.prefix))
            .collect();
        let index = (0..).find(|i| !used.contains(i)).unwrap_or(u32::MAX);
        let name = format!("{}{index}", self.prefix);
        claimed.insert(name.clone());
        name
    }

    /// Names of all interfaces currently on the host.
    ///
    /// # Errors
    /// Returns [`ExecutorError::ExternalTool`] if `ip` fails.
    pub async fn host_devices(&self) -> Result<BTreeSet<String>, ExecutorError> {
        let out = self.host.run_ok(&Invocation::new("ip", ["-o", "link", "show"])).await?;
        Ok(parse_link_names(&out).into_iter().collect())
    }

    /// Returns `true` if `ip link show <name>` succeeds.
    ///
    /// # Errors
    /// Returns [`ExecutorError::ExternalTool`] if `ip` cannot be run.
    pub async fn exists(&self, name: &str) -> Result<bool, ExecutorError> {
        let out = self.host.run(&Invocation::new("ip", ["link", "show", name])).await?;
        Ok(out.success())
    }

    async fn addresses(&self, name: &str) -> Result<Vec<(Ipv4Addr, u8)>, ExecutorError> {
        let out = self.host.run_ok(&Invocation::new("ip", ["addr", "show", "dev", name])).await?;
        Ok(parse_inet_addrs(&out))
    }

    /// Creates the TAP device if needed, assigns `host_ip/32` if given and
    /// missing, and sets the link up. Re-applying is a no-op.
    ///
    /// Returns `true` if the device was created by this call.
    ///
    /// # Errors
    /// Returns [`ExecutorError::ExternalTool`] if any `ip` step fails.
    pub async fn provision(&self, name: &str, host_ip: Option<Ipv4Addr>) -> Result<bool, ExecutorError> {
        let created = if self.exists(name).await? {
            false
        } else {
            self.host
                .run_ok(&Invocation::new("ip", ["tuntap", "add", name, "mode", "tap"]).privileged())
                .await?;
            true
        };

        if let Some(ip) = host_ip {
            let assigned = self.addresses(name).await?.contains(&(ip, 32));
            if !assigned {
                let cidr = format!("{ip}/32");
                self.host
                    .run_ok(&Invocation::new("ip", ["addr", "add", &cidr, "dev", name]).privileged())
                    .await?;
            }
        }

        self.host
            .run_ok(&Invocation::new("ip", ["link", "set", name, "up"]).privileged())
            .await?;

        tracing::info!(device = %name, created, "TAP device ready");
        Ok(created)
    }

    /// Routes `guest_ip/32` through `device` unless a route already exists.
    ///
    /// Returns `true` if a route was added.
    ///
    /// # Errors
    /// Returns [`ExecutorError::ExternalTool`] if `ip route` fails.
    pub async fn add_route(&self, guest_ip: Ipv4Addr, device: &str) -> Result<bool, ExecutorError> {
        let cidr = format!("{guest_ip}/32");
        let existing = self.host.run_ok(&Invocation::new("ip", ["route", "show", &cidr])).await?;
        if !existing.trim().is_empty() {
            return Ok(false);
        }
        self.host
            .run_ok(&Invocation::new("ip", ["route", "add", &cidr, "dev", device]).privileged())
            .await?;
        tracing::info!(device = %device, route = %cidr, "route added");
        Ok(true)
    }

    /// Deletes `name`. Routes through it disappear with it.
    ///
    /// # Errors
    /// Returns [`ExecutorError::ExternalTool`] if the device exists but
    /// cannot be deleted.
    pub async fn teardown(&self, name: &str) -> Result<Teardown, ExecutorError> {
        if !self.exists(name).await? {
            tracing::warn!(device = %name, "TAP device already absent");
            return Ok(Teardown::Absent);
        }
        self.host
            .run_ok(&Invocation::new("ip", ["link", "del", name]).privileged())
            .await?;
        tracing::info!(device = %name, "TAP device removed");
        Ok(Teardown::Removed)
    }

    /// Checks a pre-provisioned device without modifying it.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Validation`] if the device is missing, does
    /// not carry `expected_ip`, or `route_target` is not routed through it.
    pub async fn validate_external(
        &self,
        name: &str,
        expected_ip: Option<Ipv4Addr>,
        route_target: Option<Ipv4Addr>,
    ) -> Result<(), ExecutorError> {
        if !self.exists(name).await? {
            return Err(ExecutorError::Validation(format!(
                "external device '{name}' does not exist"
            )));
        }
        if let Some(ip) = expected_ip {
            if !self.addresses(name).await?.iter().any(|(addr, _)| *addr == ip) {
                return Err(ExecutorError::Validation(format!(
                    "external device '{name}' does not carry {ip}"
                )));
            }
        }
        if let Some(target) = route_target {
            let target_str = target.to_string();
            let out = self.host.run(&Invocation::new("ip", ["route", "get", &target_str])).await?;
            let tokens: Vec<&str> = out.stdout.split_whitespace().collect();
            let via = out.success() && tokens.windows(2).any(|w| w[0] == "dev" && w[1] == name);
            if !via {
                return Err(ExecutorError::Validation(format!(
                    "no route for {target} goes through external device '{name}'"
                )));
            }
        }
        Ok(())
    }

    /// First non-loopback IPv4 address on `name`, if any.
    ///
    /// # Errors
    /// Returns [`ExecutorError::ExternalTool`] if `ip addr show` fails.
    pub async fn device_ipv4(&self, name: &str) -> Result<Option<Ipv4Addr>, ExecutorError> {
        Ok(self
            .addresses(name)
            .await?
            .into_iter()
            .map(|(ip, _)| ip)
            .find(|ip| !ip.is_loopback()))
    }
}
