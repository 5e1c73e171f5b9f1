//! Safety gate: a device must be unmounted before any workload touches it.
//!
//! Unmounting is fail-fast per device. When one partition fails to unmount,
//! partitions already unmounted stay unmounted; they are not remounted.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::StressConfig;
use crate::devices::Device;
use crate::system::mounts::MountTable;
use crate::system::process;

const UNMOUNT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum MountError {
    #[error("device {device} is mounted at {}; enable auto-unmount or unmount it manually", display_points(.mount_points))]
    Mounted {
        device: String,
        mount_points: Vec<PathBuf>,
    },

    #[error("failed to unmount {partition} from {}: {reason}", .mount_point.display())]
    Unmount {
        partition: String,
        mount_point: PathBuf,
        reason: String,
    },

    #[error("mount table unavailable: {0}")]
    MountTable(String),
}

fn display_points(points: &[PathBuf]) -> String {
    points
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Proof that a device had no mounted filesystems when checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unmounted {
    pub device: String,
    /// Partitions this gate unmounted (empty if the device was already clear).
    pub unmounted: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SafetyGate {
    umount: String,
    use_sudo: bool,
    mount_table: PathBuf,
}

impl SafetyGate {
    pub fn new(config: &StressConfig) -> Self {
        Self {
            umount: config.tools.umount.clone(),
            use_sudo: config.tools.use_sudo,
            mount_table: config.devices.mount_table.clone(),
        }
    }

    fn read_table(&self) -> Result<MountTable, MountError> {
        MountTable::read(&self.mount_table).map_err(|e| MountError::MountTable(format!("{:#}", e)))
    }

    /// Verify, without side effects, that `device` is not mounted.
    pub fn check(&self, device: &Device) -> Result<Unmounted, MountError> {
        let table = self.read_table()?;
        let entries = table.entries_for(&device.name);
        if entries.is_empty() {
            return Ok(Unmounted {
                device: device.name.clone(),
                unmounted: Vec::new(),
            });
        }
        Err(MountError::Mounted {
            device: device.path.clone(),
            mount_points: entries.iter().map(|e| e.mount_point.clone()).collect(),
        })
    }

    /// Make sure `device` is unmounted, unmounting every mounted partition
    /// (most recent mount first) if needed.
    pub async fn ensure_unmounted(&self, device: &Device) -> Result<Unmounted, MountError> {
        let table = self.read_table()?;
        let entries: Vec<_> = table
            .entries_for(&device.name)
            .into_iter()
            .cloned()
            .collect();
        if entries.is_empty() {
            return Ok(Unmounted {
                device: device.name.clone(),
                unmounted: Vec::new(),
            });
        }

        let mut unmounted = Vec::new();
        for entry in entries.iter().rev() {
            info!(
                device = %device.name,
                partition = %entry.source,
                mount_point = %entry.mount_point.display(),
                "unmounting"
            );
            let mut cmd = process::tool_command(&self.umount, self.use_sudo);
            cmd.arg(&entry.mount_point);
            let fail = |reason: String| MountError::Unmount {
                partition: entry.source.clone(),
                mount_point: entry.mount_point.clone(),
                reason,
            };
            let output = process::output_with_timeout(cmd, UNMOUNT_TIMEOUT)
                .await
                .map_err(|e| fail(e.to_string()))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                warn!(
                    device = %device.name,
                    partition = %entry.source,
                    already_unmounted = ?unmounted,
                    "unmount failed, aborting"
                );
                return Err(fail(if stderr.is_empty() {
                    format!("exit code {:?}", output.status.code())
                } else {
                    stderr
                }));
            }
            if !unmounted.contains(&entry.source) {
                unmounted.push(entry.source.clone());
            }
        }

        Ok(Unmounted {
            device: device.name.clone(),
            unmounted,
        })
    }
}
