//! Command-line arguments.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fcm_core::metadata::parse_user_metadata;
use fcm_core::{CreateRequest, NetworkRequest, VmName};
use fcm_executor::CreateDefaults;
use serde_json::{Map, Value};

/// Manage Firecracker microVMs on this host.
#[derive(Parser, Debug)]
#[command(name = "fcm", version)]
pub struct Cli {
    /// Settings file (KEY=VALUE lines); defaults to /etc/firecracker.env
    #[arg(long, global = true, env = "FCM_ENV_FILE")]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create and boot a VM
    Create(CreateArgs),
    /// Delete a stopped VM's rootfs, devices, supervisor program and record
    Destroy(DestroyArgs),
    /// Stop a VM, keeping everything needed to start it again
    Stop(NameArg),
    /// Boot a stopped VM from its record
    Start(NameArg),
    /// Stop then start a VM
    Restart(NameArg),
    /// Show all VMs
    List(ListArgs),
    /// Show kernels in the kernel directory
    Kernels,
    /// Show base images in the images directory
    Images,
}

#[derive(Args, Debug)]
pub struct NameArg {
    /// VM name
    pub name: VmName,
}

#[derive(Args, Debug)]
pub struct DestroyArgs {
    /// VM name
    pub name: VmName,

    /// Do not ask for confirmation
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,

    /// Only show answering API sockets, with or without a record
    #[arg(long)]
    pub running: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Driver {
    /// The manager creates and deletes the TAP devices
    #[default]
    Internal,
    /// The TAP devices are pre-provisioned and only validated
    External,
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// VM name
    pub name: VmName,

    /// Kernel file in the kernel directory, or an absolute path [env: KERNEL]
    #[arg(long)]
    pub kernel: Option<String>,

    /// Base image in the images directory [env: IMAGE]
    #[arg(long)]
    pub image: Option<String>,

    /// Rootfs size, e.g. 2G [env: ROOTFS_SIZE]
    #[arg(long)]
    pub rootfs_size: Option<String>,

    /// Replace an existing rootfs file
    #[arg(long)]
    pub force_rootfs: bool,

    /// Guest IP address
    #[arg(long)]
    pub vm_ip: Ipv4Addr,

    /// Host TAP IP address (the guest's gateway)
    #[arg(long)]
    pub tap_ip: Ipv4Addr,

    /// Number of vCPUs [env: CPUS]
    #[arg(long)]
    pub cpus: Option<u8>,

    /// Memory in MiB [env: MEMORY]
    #[arg(long)]
    pub memory: Option<u32>,

    /// Guest hostname; defaults to the VM name
    #[arg(long)]
    pub hostname: Option<String>,

    /// MMDS metadata as a JSON object, or @path to a JSON file
    #[arg(long)]
    pub metadata: Option<String>,

    /// Primary TAP device; generated in internal mode if omitted
    #[arg(long)]
    pub tap_device: Option<String>,

    /// MMDS TAP device; generated in internal mode if omitted
    #[arg(long)]
    pub mmds_tap: Option<String>,

    /// Who owns the TAP devices
    #[arg(long, value_enum, default_value_t)]
    pub networkdriver: Driver,

    /// Run firecracker attached to this terminal until it exits or Ctrl-C
    #[arg(long)]
    pub foreground: bool,
}

/// Reads `--metadata`: inline JSON or `@file`.
///
/// # Errors
/// Fails if the file cannot be read or the text is not a JSON object.
pub fn load_metadata(arg: Option<&str>) -> anyhow::Result<Map<String, Value>> {
    let Some(arg) = arg else {
        return Ok(Map::new());
    };
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading metadata file {path}"))?,
        None => arg.to_owned(),
    };
    Ok(parse_user_metadata(&text)?)
}

fn pick<T: Clone>(flag: &str, key: &str, value: Option<T>, fallback: Option<&T>) -> anyhow::Result<T> {
    match value.or_else(|| fallback.cloned()) {
        Some(v) => Ok(v),
        None => bail!("--{flag} is required (or set {key} in the settings file)"),
    }
}

impl CreateArgs {
    /// Builds the create request, taking omitted values from `defaults`.
    ///
    /// # Errors
    /// Fails if a required value is missing everywhere, if external mode
    /// lacks a device name, or if the metadata is invalid.
    pub fn into_request(self, defaults: &CreateDefaults) -> anyhow::Result<CreateRequest> {
        let network = match self.networkdriver {
            Driver::Internal => NetworkRequest::Internal { tap_device: self.tap_device, mmds_tap: self.mmds_tap },
            Driver::External => {
                let (Some(tap_device), Some(mmds_tap)) = (self.tap_device, self.mmds_tap) else {
                    bail!("--networkdriver external requires --tap-device and --mmds-tap");
                };
                NetworkRequest::External { tap_device, mmds_tap }
            }
        };
        Ok(CreateRequest {
            kernel: pick("kernel", "KERNEL", self.kernel, defaults.kernel.as_ref())?,
            image: pick("image", "IMAGE", self.image, defaults.image.as_ref())?,
            rootfs_size: pick("rootfs-size", "ROOTFS_SIZE", self.rootfs_size, defaults.rootfs_size.as_ref())?,
            cpus: pick("cpus", "CPUS", self.cpus, defaults.cpus.as_ref())?,
            memory: pick("memory", "MEMORY", self.memory, defaults.memory.as_ref())?,
            metadata: load_metadata(self.metadata.as_deref())?,
            name: self.name,
            vm_ip: self.vm_ip,
            tap_ip: self.tap_ip,
            hostname: self.hostname,
            network,
            force_rootfs: self.force_rootfs,
        })
    }
}
