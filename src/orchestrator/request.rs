use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workload::WorkloadKind;

/// Shortest accepted run, seconds.
pub const MIN_DURATION_SECS: u64 = 10;
/// Longest accepted run (24h), seconds.
pub const MAX_DURATION_SECS: u64 = 86_400;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("duration {value}s is outside the allowed range [{min}, {max}]")]
    DurationOutOfRange { value: u64, min: u64, max: u64 },

    #[error("device name is empty")]
    EmptyDevice,

    #[error("invalid device name {0:?}")]
    InvalidDevice(String),

    #[error("log label {0:?} contains control characters")]
    InvalidLabel(String),
}

fn default_auto_unmount() -> bool {
    true
}

fn default_workload() -> WorkloadKind {
    WorkloadKind::AiSimulated
}

/// A request to stress one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRequest {
    /// Device name (`nvme1n1`) or node path (`/dev/nvme1n1`).
    pub device: String,
    #[serde(rename = "duration")]
    pub duration_secs: u64,
    #[serde(default = "default_workload")]
    pub workload: WorkloadKind,
    #[serde(default = "default_auto_unmount")]
    pub auto_unmount: bool,
    #[serde(default)]
    pub log_label: Option<String>,
}

impl TestRequest {
    pub fn new(device: &str, duration_secs: u64, workload: WorkloadKind) -> Self {
        Self {
            device: device.to_string(),
            duration_secs,
            workload,
            auto_unmount: true,
            log_label: None,
        }
    }

    pub fn auto_unmount(mut self, enabled: bool) -> Self {
        self.auto_unmount = enabled;
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.log_label = Some(label.to_string());
        self
    }

    /// Kernel device name, with any `/dev/` prefix removed.
    pub fn device_name(&self) -> &str {
        let trimmed = self.device.trim();
        trimmed.strip_prefix("/dev/").unwrap_or(trimmed)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(MIN_DURATION_SECS..=MAX_DURATION_SECS).contains(&self.duration_secs) {
            return Err(ValidationError::DurationOutOfRange {
                value: self.duration_secs,
                min: MIN_DURATION_SECS,
                max: MAX_DURATION_SECS,
            });
        }
        let name = self.device_name();
        if name.is_empty() {
            return Err(ValidationError::EmptyDevice);
        }
        if name.starts_with('-')
            || name.starts_with('.')
            || name.chars().any(|c| !c.is_ascii_alphanumeric() && c != '-' && c != '_')
        {
            return Err(ValidationError::InvalidDevice(self.device.clone()));
        }
        if let Some(label) = &self.log_label {
            if label.chars().any(char::is_control) {
                return Err(ValidationError::InvalidLabel(label.clone()));
            }
        }
        Ok(())
    }
}
