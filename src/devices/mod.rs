//! Device discovery: eligible block devices and their current mount state.

pub mod lsblk;

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{DevicesConfig, StressConfig, ToolsConfig};
use crate::system::mounts::MountTable;
use crate::system::process;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unexpected lsblk output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no eligible devices found")]
    NoDevices,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountState {
    Mounted,
    Unmounted,
}

/// A block device that may be stress tested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    /// Kernel name, e.g. `nvme0n1`.
    pub name: String,
    /// Device node, e.g. `/dev/nvme0n1`.
    pub path: String,
    pub capacity_bytes: Option<u64>,
    pub model: String,
    pub mount_state: MountState,
}

impl Device {
    pub fn new(name: &str, capacity_bytes: Option<u64>, model: &str, mount_state: MountState) -> Self {
        Self {
            name: name.to_string(),
            path: format!("/dev/{}", name),
            capacity_bytes,
            model: model.to_string(),
            mount_state,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mount_state == MountState::Mounted
    }

    /// Capacity in human units, e.g. `931.5 GiB`.
    pub fn capacity_display(&self) -> String {
        match self.capacity_bytes {
            Some(bytes) => format_bytes(bytes),
            None => "unknown".to_string(),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.path, self.capacity_display(), self.model)
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Enumerates eligible devices. Read-only.
#[derive(Debug, Clone)]
pub struct DeviceDiscovery {
    tools: ToolsConfig,
    devices: DevicesConfig,
}

impl DeviceDiscovery {
    pub fn new(config: &StressConfig) -> Self {
        Self {
            tools: config.tools.clone(),
            devices: config.devices.clone(),
        }
    }

    /// List eligible devices. Never fails: problems are logged and yield an
    /// empty list.
    pub async fn list(&self) -> Vec<Device> {
        match self.try_list().await {
            Ok(devices) => devices,
            Err(DiscoveryError::NoDevices) => {
                info!(prefix = %self.devices.name_prefix, "no eligible devices found");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "device discovery failed");
                Vec::new()
            }
        }
    }

    /// List eligible devices, reporting why the list is empty.
    pub async fn try_list(&self) -> Result<Vec<Device>, DiscoveryError> {
        let mut cmd = process::tool_command(&self.tools.lsblk, false);
        cmd.args(["-J", "-b", "-d", "-o", "NAME,SIZE,MODEL,TYPE"]);
        let output = process::output_with_timeout(cmd, std::time::Duration::from_secs(10))
            .await
            .map_err(|source| DiscoveryError::Spawn {
                program: self.tools.lsblk.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(DiscoveryError::Failed {
                program: self.tools.lsblk.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let raw = lsblk::parse(&String::from_utf8_lossy(&output.stdout))?;

        let mounts = match MountTable::read(&self.devices.mount_table) {
            Ok(table) => table,
            Err(e) => {
                warn!(error = %e, "mount table unavailable, reporting devices as unmounted");
                MountTable::default()
            }
        };

        let devices = self.select(raw, &mounts);
        if devices.is_empty() {
            return Err(DiscoveryError::NoDevices);
        }
        debug!(count = devices.len(), "discovered devices");
        Ok(devices)
    }

    /// Apply the storage-class filter and deny-list, then attach mount state.
    pub fn select(&self, raw: Vec<lsblk::LsblkDevice>, mounts: &MountTable) -> Vec<Device> {
        let root = if self.devices.exclude_root_device {
            mounts.root_device()
        } else {
            None
        };

        raw.into_iter()
            .filter(|d| d.kind.as_deref().map_or(true, |k| k == "disk"))
            .filter(|d| d.name.starts_with(&self.devices.name_prefix))
            .filter(|d| {
                let denied = self.devices.deny_list.iter().any(|n| n == &d.name)
                    || root.as_deref() == Some(d.name.as_str());
                if denied {
                    debug!(device = %d.name, "device excluded by deny-list");
                }
                !denied
            })
            .map(|d| {
                let state = if mounts.is_mounted(&d.name) {
                    MountState::Mounted
                } else {
                    MountState::Unmounted
                };
                let model = d.model.as_deref().map(str::trim).unwrap_or("Unknown");
                Device::new(&d.name, d.size, model, state)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> Vec<lsblk::LsblkDevice> {
        lsblk::parse(
            r#"{"blockdevices":[
                {"name":"nvme0n1","size":1000204886016,"model":"Boot Disk","type":"disk"},
                {"name":"nvme1n1","size":2000398934016,"model":"Samsung SSD 990 PRO 2TB ","type":"disk"},
                {"name":"nvme2n1","size":2000398934016,"model":null,"type":"disk"},
                {"name":"nvme3n1","size":4000787030016,"model":"Spare","type":"disk"},
                {"name":"sda","size":256060514304,"model":"USB","type":"disk"},
                {"name":"loop0","size":1000,"model":null,"type":"loop"}
            ]}"#,
        )
        .unwrap()
    }

    fn mounts() -> MountTable {
        MountTable::parse(
            "/dev/nvme0n1p2 / ext4 rw 0 0\n/dev/nvme2n1p1 /mnt/data ext4 rw 0 0\n",
        )
    }

    #[test]
    fn test_select_filters_and_mount_state() {
        let mut cfg = StressConfig::default();
        cfg.devices.deny_list = vec!["nvme3n1".to_string()];
        let discovery = DeviceDiscovery::new(&cfg);

        let devices = discovery.select(raw(), &mounts());
        let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["nvme1n1", "nvme2n1"]);

        assert_eq!(devices[0].mount_state, MountState::Unmounted);
        assert_eq!(devices[0].model, "Samsung SSD 990 PRO 2TB");
        assert_eq!(devices[0].path, "/dev/nvme1n1");
        assert_eq!(devices[1].mount_state, MountState::Mounted);
        assert_eq!(devices[1].model, "Unknown");
    }

    #[test]
    fn test_root_device_can_be_offered() {
        let mut cfg = StressConfig::default();
        cfg.devices.exclude_root_device = false;
        let discovery = DeviceDiscovery::new(&cfg);
        let devices = discovery.select(raw(), &mounts());
        assert!(devices.iter().any(|d| d.name == "nvme0n1"));
    }

    #[test]
    fn test_capacity_display() {
        let dev = Device::new("nvme1n1", Some(2_000_398_934_016), "X", MountState::Unmounted);
        assert_eq!(dev.capacity_display(), "1.8 TiB");
        let dev = Device::new("nvme1n1", None, "X", MountState::Unmounted);
        assert_eq!(dev.capacity_display(), "unknown");
        assert_eq!(format_bytes(512), "512 B");
    }

    #[tokio::test]
    async fn test_list_is_never_fatal() {
        let mut cfg = StressConfig::default();
        cfg.tools.lsblk = "/nonexistent/lsblk".to_string();
        let discovery = DeviceDiscovery::new(&cfg);
        assert!(discovery.list().await.is_empty());
        assert!(matches!(
            discovery.try_list().await,
            Err(DiscoveryError::Spawn { .. })
        ));
    }
}
