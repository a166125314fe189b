//! OS-specific workload decoration.

use crate::constants::{
    ENV_NETSH_FILTER, ENV_TCPDUMP_FILTER, LINUX_ENTRYPOINT, PVC_MOUNT_PATH_LINUX,
    PVC_MOUNT_PATH_WINDOWS, PVC_VOLUME_NAME, WINDOWS_ENTRYPOINT,
};
use crate::domain::{CaptureTarget, NodeOs, Workload};
use crate::filter;

const WINDOWS_ADMIN_IDENTITY: &str = "NT AUTHORITY\\SYSTEM";

/// How a workload is adapted to the operating system of its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsPlan {
    /// tcpdump running as root.
    Linux,
    /// netsh trace in a host-process container.
    Windows,
}

impl OsPlan {
    pub fn for_os(os: NodeOs) -> Self {
        match os {
            NodeOs::Linux => OsPlan::Linux,
            NodeOs::Windows => OsPlan::Windows,
        }
    }

    /// Apply command, identity, mounts and filter env for `target`.
    pub fn decorate(&self, workload: &mut Workload, target: &CaptureTarget) {
        match self {
            OsPlan::Linux => {
                let container = &mut workload.spec.container;
                container.security_context.run_as_user = Some(0);
                container.command = vec![LINUX_ENTRYPOINT.to_string()];

                workload.remove_env(ENV_NETSH_FILTER);
                let compiled = workload.env(ENV_TCPDUMP_FILTER).unwrap_or_default().to_string();
                let merged = filter::merge_pod_ips(&compiled, &target.pod_ips, NodeOs::Linux);
                if !merged.is_empty() {
                    workload.set_env(ENV_TCPDUMP_FILTER, merged);
                }
            }
            OsPlan::Windows => {
                let container = &mut workload.spec.container;
                container.security_context.host_process = true;
                container.security_context.run_as_user_name =
                    Some(WINDOWS_ADMIN_IDENTITY.to_string());
                container.command = vec![WINDOWS_ENTRYPOINT.to_string()];

                if let Some(mount) = workload.volume_mount_mut(PVC_VOLUME_NAME) {
                    if mount.mount_path == PVC_MOUNT_PATH_LINUX {
                        mount.mount_path = PVC_MOUNT_PATH_WINDOWS.to_string();
                    }
                }

                workload.remove_env(ENV_TCPDUMP_FILTER);
                let netsh = filter::merge_pod_ips("", &target.pod_ips, NodeOs::Windows);
                if !netsh.is_empty() {
                    workload.set_env(ENV_NETSH_FILTER, netsh);
                }
            }
        }
    }
}
