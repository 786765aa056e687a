//! Subcommand execution.

use std::fmt::Display;

use async_trait::async_trait;
use fcm_executor::{
    Confirm, CreateMode, DestroyOutcome, DestroyPlan, RowState, Settings, SystemOrchestrator, VmRow,
};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::cli::{Command, CreateArgs, DestroyArgs, ListArgs};

/// Asks on the terminal before a destroy.
struct TerminalConfirm;

#[async_trait]
impl Confirm for TerminalConfirm {
    async fn confirm(&self, plan: &DestroyPlan) -> bool {
        eprintln!("\nWARNING: this will permanently delete:");
        eprintln!("   - VM rootfs file: {}", plan.rootfs.display());
        for device in &plan.remove_devices {
            eprintln!("   - TAP device: {device}");
        }
        if !plan.keep_devices.is_empty() {
            eprintln!("   - NOTE: TAP devices {} are kept (external network mode)", plan.keep_devices.join(", "));
        }
        eprintln!("   - supervisor program '{}'", plan.name);
        eprintln!("   - VM record");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            eprint!("\nAre you sure you want to destroy VM '{}'? (yes/no): ", plan.name);
            match lines.next_line().await {
                Ok(Some(answer)) => match answer.trim().to_ascii_lowercase().as_str() {
                    "yes" | "y" => return true,
                    "no" | "n" => return false,
                    _ => eprintln!("Please enter 'yes' or 'no'"),
                },
                Ok(None) | Err(_) => return false,
            }
        }
    }
}

pub async fn run(command: Command, settings: Settings) -> anyhow::Result<()> {
    match command {
        Command::Kernels => print_names("kernels", &settings.kernel_dir, settings.list_kernels()?),
        Command::Images => print_names("images", &settings.images_dir, settings.list_images()?),
        command => {
            let orch = SystemOrchestrator::system(settings);
            match command {
                Command::Create(args) => create(&orch, args).await?,
                Command::Destroy(args) => destroy(&orch, args).await?,
                Command::Stop(args) => {
                    orch.stop(&args.name).await?;
                    println!("VM '{}' stopped", args.name);
                }
                Command::Start(args) => {
                    let handle = orch.start(&args.name).await?;
                    println!("VM '{}' started ({})", args.name, handle.process);
                }
                Command::Restart(args) => {
                    let handle = orch.restart(&args.name).await?;
                    println!("VM '{}' restarted ({})", args.name, handle.process);
                }
                Command::List(args) => list(&orch, &args).await?,
                Command::Kernels | Command::Images => {}
            }
        }
    }
    Ok(())
}

async fn create(orch: &SystemOrchestrator, args: CreateArgs) -> anyhow::Result<()> {
    let mode = if args.foreground { CreateMode::Foreground } else { CreateMode::Supervised };
    let request = args.into_request(&orch.settings().defaults)?;
    let report = orch.create(&request, mode).await?;
    let record = &report.record;
    println!("VM '{}' created", record.name);
    println!("  socket:  {}", report.handle.socket_path.display());
    println!("  rootfs:  {}", record.rootfs.display());
    println!("  devices: {} (mmds {}), {}", record.tap_device, record.mmds_tap, record.networkdriver);
    println!("  guest:   {} via {}", record.vm_ip, record.tap_ip);
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    Ok(())
}

async fn destroy(orch: &SystemOrchestrator, args: DestroyArgs) -> anyhow::Result<()> {
    match orch.destroy(&args.name, args.force, &TerminalConfirm).await? {
        DestroyOutcome::NothingToDestroy => println!("No VM named '{}'; nothing to destroy", args.name),
        DestroyOutcome::Cancelled => println!("VM destruction cancelled."),
        DestroyOutcome::Destroyed(report) => {
            for warning in &report.warnings {
                eprintln!("warning: {warning}");
            }
            if !report.kept_devices.is_empty() {
                println!("TAP devices kept: {}", report.kept_devices.join(", "));
            }
            println!("VM '{}' destroyed", report.name);
        }
    }
    Ok(())
}

fn cell<T: Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_owned(), |v| v.to_string())
}

fn state_label(state: RowState) -> &'static str {
    match state {
        RowState::Running => "running",
        RowState::Stopped => "stopped",
        RowState::Unknown => "unknown",
    }
}

fn format_row(row: &VmRow) -> String {
    format!(
        "{:<16} {:<8} {:>4} {:>7} {:<10} {:<10} {:<15} {:<15} {:<8} {}",
        row.name,
        state_label(row.state),
        cell(row.vcpus),
        cell(row.memory),
        cell(row.tap_device.as_deref()),
        cell(row.mmds_tap.as_deref()),
        cell(row.vm_ip),
        cell(row.tap_ip),
        cell(row.networkdriver),
        cell(row.rootfs.as_ref().map(|p| p.display())),
    )
}

async fn list(orch: &SystemOrchestrator, args: &ListArgs) -> anyhow::Result<()> {
    if args.running {
        let running = orch.list_running().await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&running)?);
        } else {
            for vm in &running {
                println!("{:<16} {}", vm.name, vm.socket.display());
            }
        }
        return Ok(());
    }

    let rows = orch.list_all().await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No VMs found.");
        return Ok(());
    }
    println!(
        "{:<16} {:<8} {:>4} {:>7} {:<10} {:<10} {:<15} {:<15} {:<8} ROOTFS",
        "NAME", "STATE", "CPUS", "MEM_MIB", "TAP", "MMDS_TAP", "VM_IP", "TAP_IP", "DRIVER"
    );
    for row in &rows {
        println!("{}", format_row(row));
        if let Some(error) = &row.error {
            println!("  error: {error}");
        }
    }
    Ok(())
}

fn print_names(what: &str, dir: &std::path::Path, names: Vec<String>) {
    if names.is_empty() {
        println!("No {what} found in {}", dir.display());
        return;
    }
    println!("Available {what} in {}:", dir.display());
    for name in names {
        println!("  {name}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn row_formatting_uses_dashes_for_unknown_values() {
        let row = VmRow {
            name: "broken".to_owned(),
            state: RowState::Unknown,
            vcpus: None,
            memory: None,
            rootfs: None,
            tap_device: None,
            mmds_tap: None,
            vm_ip: None,
            tap_ip: None,
            networkdriver: None,
            error: Some("bad record".to_owned()),
        };
        let line = format_row(&row);
        assert!(line.starts_with("broken"));
        assert!(line.contains("unknown"));
        assert!(!line.contains("None"));
        assert!(line.trim_end().ends_with('-'));
    }

    #[test]
    fn row_formatting_shows_addresses() {
        let row = VmRow {
            name: "t1".to_owned(),
            state: RowState::Running,
            vcpus: Some(2),
            memory: Some(1024),
            rootfs: Some("/var/lib/firecracker/rootfs/t1.ext4".into()),
            tap_device: Some("tap0".to_owned()),
            mmds_tap: Some("tap1".to_owned()),
            vm_ip: Some(Ipv4Addr::new(172, 16, 0, 2)),
            tap_ip: Some(Ipv4Addr::new(172, 16, 0, 1)),
            networkdriver: Some(fcm_core::NetworkDriver::Internal),
            error: None,
        };
        let line = format_row(&row);
        for part in ["running", "1024", "tap0", "tap1", "172.16.0.2", "172.16.0.1", "internal", "t1.ext4"] {
            assert!(line.contains(part), "{part} missing from {line:?}");
        }
    }
}
