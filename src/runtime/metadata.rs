//! Node network metadata bundled with a capture.
//!
//! Failures of individual commands are recorded and skipped so that a
//! partially readable node still yields a capture.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::error::RuntimeError;

use super::{combined_output, command_line};

const COLLECT_LOGS_SCRIPT: &str = "c:\\k\\debug\\collectlogs.ps1";
const POWERSHELL_DIR: &str = "C:\\WINDOWS\\System32\\WindowsPowerShell\\v1.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MetadataCommand {
    pub program: String,
    pub args: Vec<String>,
    pub description: &'static str,
}

impl MetadataCommand {
    fn new(program: impl Into<String>, args: &[&str], description: &'static str) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            description,
        }
    }

    fn line(&self) -> String {
        command_line(&self.program, &self.args)
    }
}

/// Commands whose output goes into one file, or is discarded when `file_name` is None.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MetadataGroup {
    pub file_name: Option<&'static str>,
    pub commands: Vec<MetadataCommand>,
}

/// Pick the iptables backend holding more rules.
pub(crate) fn iptables_mode(legacy_save: &str, nft_save: &str) -> &'static str {
    if legacy_save.split('\n').count() > nft_save.split('\n').count() {
        "legacy"
    } else {
        "nft"
    }
}

pub(crate) fn linux_groups(workdir: &Path, iptables_mode: &str) -> Vec<MetadataGroup> {
    let save = format!("iptables-{}-save", iptables_mode);
    let iptables = format!("iptables-{}", iptables_mode);
    let proc_net = workdir.join("proc-net").display().to_string();
    let proc_sys_net = workdir.join("proc-sys-net").display().to_string();

    vec![
        MetadataGroup {
            file_name: Some("ip-resources.txt"),
            commands: vec![
                MetadataCommand::new("ip", &["-d", "-j", "addr", "show"], "IP address configuration"),
                MetadataCommand::new("ip", &["-d", "-j", "neighbor", "show"], "IP neighbor status"),
                MetadataCommand::new("ip", &["rule", "list"], "Policy routing list"),
                MetadataCommand::new("ip", &["route", "show", "table", "all"], "Routes of all route tables"),
            ],
        },
        MetadataGroup {
            file_name: Some("iptables-rules.txt"),
            commands: vec![
                MetadataCommand::new(save, &[], "IPtables rules"),
                MetadataCommand::new(iptables.clone(), &["-vnx", "-L"], "IPtables rules and stats in filter table"),
                MetadataCommand::new(iptables.clone(), &["-vnx", "-L", "-t", "nat"], "IPtables rules and stats in nat table"),
                MetadataCommand::new(iptables, &["-vnx", "-L", "-t", "mangle"], "IPtables rules and stats in mangle table"),
            ],
        },
        MetadataGroup {
            file_name: Some("socket-stats.txt"),
            commands: vec![
                MetadataCommand::new("ss", &["-s"], "Socket statistics summary"),
                MetadataCommand::new("ss", &["-tapionume"], "Socket statistics details"),
            ],
        },
        // Host network namespace only, even for pod targets.
        MetadataGroup {
            file_name: None,
            commands: vec![
                MetadataCommand::new("cp", &["-r", "/proc/self/net", proc_net.as_str()], "networking stats"),
                MetadataCommand::new("cp", &["-r", "/proc/sys/net", proc_sys_net.as_str()], "kernel networking configuration"),
            ],
        },
    ]
}

pub(crate) async fn collect_linux(workdir: &Path) -> Result<(), RuntimeError> {
    info!("Collecting network metadata");

    let mode = detect_iptables_mode().await;
    info!("Using iptables mode {}", mode);

    for group in linux_groups(workdir, mode) {
        run_group(workdir, &group).await;
    }

    #[cfg(not(windows))]
    {
        let inventory = interface_inventory();
        if let Err(e) = tokio::fs::write(workdir.join("interfaces.txt"), inventory).await {
            warn!("Failed to write interface inventory: {}", e);
        }
    }

    info!("Done collecting network metadata");
    Ok(())
}

async fn detect_iptables_mode() -> &'static str {
    let legacy = save_output("iptables-legacy-save").await;
    let nft = save_output("iptables-nft-save").await;
    iptables_mode(&legacy, &nft)
}

async fn save_output(program: &str) -> String {
    match combined_output(program, &[]).await {
        Ok(output) => output,
        Err(RuntimeError::ToolFailed { output, .. }) => output,
        Err(_) => String::new(),
    }
}

/// Run one group, writing a summary and the output of each command.
pub(crate) async fn run_group(workdir: &Path, group: &MetadataGroup) {
    let Some(file_name) = group.file_name else {
        for command in &group.commands {
            // Some /proc/sys/net entries are write-only, so cp reports errors.
            if let Err(e) = combined_output(&command.program, &command.args).await {
                error!("Failed to run {}: {}", command.line(), e);
            }
        }
        return;
    };

    let path = workdir.join(file_name);
    if let Err(e) = write_group(&path, group).await {
        error!("Failed to write metadata file {}: {}", path.display(), e);
    }
}

async fn write_group(path: &Path, group: &MetadataGroup) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    let mut summary = String::from("Summary:\n\n");
    for command in &group.commands {
        summary.push_str(&format!("{}({})\n", command.line(), command.description));
    }
    summary.push_str("\nExecute:\n\n");
    file.write_all(summary.as_bytes()).await?;

    for command in &group.commands {
        file.write_all(format!("{}\n\n", command.line()).as_bytes())
            .await?;
        match Command::new(&command.program)
            .args(&command.args)
            .output()
            .await
        {
            Ok(output) => {
                file.write_all(&output.stdout).await?;
                file.write_all(&output.stderr).await?;
                if !output.status.success() {
                    warn!("{} exited with {}", command.line(), output.status);
                }
            }
            Err(e) => {
                error!("Failed to run {}: {}", command.line(), e);
                // The workload may be gone before anyone reads the pod log.
                file.write_all(format!("Failed to run {:?}, error: {}\n", command.line(), e).as_bytes())
                    .await?;
            }
        }
    }
    file.flush().await
}

#[cfg(not(windows))]
fn interface_inventory() -> String {
    use pnet::datalink;

    datalink::interfaces()
        .into_iter()
        .map(|iface| {
            let status = if iface.is_up() { "UP" } else { "DOWN" };
            let mac = iface
                .mac
                .map(|m| m.to_string())
                .unwrap_or_else(|| "-".to_string());
            let ips: Vec<_> = iface.ips.iter().map(|ip| ip.to_string()).collect();
            format!(
                "{} (index {}): {} mac {} [{}]\n",
                iface.name,
                iface.index,
                status,
                mac,
                if ips.is_empty() {
                    "no IP".to_string()
                } else {
                    ips.join(", ")
                }
            )
        })
        .collect()
}

/// Log folder reported by collectlogs.ps1.
pub(crate) fn collect_logs_folder(output: &str) -> Option<String> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"Logs are available at ([^\r\n]+)").ok())
        .as_ref()?;
    pattern
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|p| !p.is_empty())
}

/// PowerShell by name when its directory is on `path_var`, otherwise by full path.
pub(crate) fn powershell_program(path_var: Option<&str>) -> String {
    if path_var.is_some_and(|p| p.contains(POWERSHELL_DIR)) {
        "powershell".to_string()
    } else {
        format!("{}\\powershell.exe", POWERSHELL_DIR)
    }
}

/// Run the node's pre-staged collectlogs.ps1 and copy its log bundle into `workdir`.
pub(crate) async fn collect_windows(workdir: &Path) -> Result<(), RuntimeError> {
    info!("Collecting network metadata");

    if !Path::new(COLLECT_LOGS_SCRIPT).exists() {
        return Err(RuntimeError::ToolFailed {
            tool: "collectlogs.ps1".to_string(),
            output: format!("{} not found on node", COLLECT_LOGS_SCRIPT),
        });
    }

    let powershell = powershell_program(std::env::var("PATH").ok().as_deref());

    let output = combined_output(
        &powershell,
        &["-file".to_string(), COLLECT_LOGS_SCRIPT.to_string()],
    )
    .await?;
    info!("collectlogs.ps1 finished");

    let logs = collect_logs_folder(&output).ok_or_else(|| RuntimeError::ToolFailed {
        tool: "collectlogs.ps1".to_string(),
        output: "no log folder reported".to_string(),
    })?;

    let metadata_dir = workdir.join("metadata");
    tokio::fs::create_dir(&metadata_dir).await?;
    let copied = combined_output(
        "xcopy",
        &[logs.clone(), metadata_dir.display().to_string(), "/e".to_string()],
    )
    .await;

    if let Err(e) = tokio::fs::remove_dir_all(&logs).await {
        warn!("Failed to remove {}: {}", logs, e);
    }
    copied?;

    info!("Done collecting network metadata");
    Ok(())
}
