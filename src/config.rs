//! TOML configuration for nvme-stress.
//!
//! Every section has compiled-in defaults so an empty (or missing) file is a
//! valid configuration. The file location can be given explicitly, through the
//! `NVME_STRESS_CONFIG` environment variable, or at the standard system path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "NVME_STRESS_CONFIG";

/// Standard system-wide config location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/nvme-stress/nvme-stress.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StressConfig {
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl StressConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve configuration, in order:
    /// 1. `explicit`, when given (errors are fatal here).
    /// 2. The path in `NVME_STRESS_CONFIG`.
    /// 3. `/etc/nvme-stress/nvme-stress.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "{} set but file could not be loaded, trying fallback",
                        CONFIG_ENV
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// External collaborator programs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Workload generator (fio-compatible command line).
    pub fio: String,
    /// Health-query tool (smartctl-compatible command line).
    pub smartctl: String,
    /// Block device lister (must support `-J`).
    pub lsblk: String,
    /// Unmount helper.
    pub umount: String,
    /// Run privileged tools (fio, smartctl, umount) through `sudo`.
    pub use_sudo: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            fio: "fio".to_string(),
            smartctl: "smartctl".to_string(),
            lsblk: "lsblk".to_string(),
            umount: "umount".to_string(),
            use_sudo: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// Device selection and mount-table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Only block devices whose name starts with this prefix are offered.
    pub name_prefix: String,
    /// Device names that are never offered for testing.
    pub deny_list: Vec<String>,
    /// Also deny the device that backs the root filesystem.
    pub exclude_root_device: bool,
    /// Live mount table.
    pub mount_table: PathBuf,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            name_prefix: "nvme".to_string(),
            deny_list: Vec::new(),
            exclude_root_device: true,
            mount_table: PathBuf::from("/proc/mounts"),
        }
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Telemetry sampling intervals and sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Per-device temperature sampling interval (seconds).
    pub device_interval_secs: u64,
    /// Host-wide temperature sampling interval (seconds).
    pub system_interval_secs: u64,
    /// sysfs thermal zone reporting millidegrees Celsius.
    pub thermal_zone: PathBuf,
    /// Upper bound on a single health query (seconds).
    pub query_timeout_secs: u64,
}

impl TelemetryConfig {
    pub fn device_interval(&self) -> Duration {
        Duration::from_secs(self.device_interval_secs.max(1))
    }

    pub fn system_interval(&self) -> Duration {
        Duration::from_secs(self.system_interval_secs.max(1))
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs.max(1))
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            device_interval_secs: 5,
            system_interval_secs: 30,
            thermal_zone: PathBuf::from("/sys/class/thermal/thermal_zone0/temp"),
            query_timeout_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Workload
// ---------------------------------------------------------------------------

/// Workload generator settings shared by every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// fio I/O engine.
    pub ioengine: String,
    /// Time a terminated workload gets to exit before it is killed (seconds).
    pub stop_grace_secs: u64,
    /// Share of an AI-simulated run spent in the checkpoint phase (percent).
    pub checkpoint_share_percent: u8,
}

impl WorkloadConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            ioengine: "libaio".to_string(),
            stop_grace_secs: 5,
            checkpoint_share_percent: 25,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Run logs and diagnostic output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory holding one log file per test run.
    pub dir: PathBuf,
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit diagnostics as JSON lines.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

/// HTTP control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
