//! Device health queries through an external SMART tool.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::StressConfig;
use crate::devices::Device;
use crate::system::process;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {code:?} and no output: {stderr}")]
    NoOutput {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Overall health self-assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthVerdict {
    Healthy,
    Failed,
    Unknown,
}

/// Source of raw device health text.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Full diagnostic dump (temperature-bearing).
    async fn report(&self, device: &Device) -> Result<String, HealthError>;

    /// Overall self-assessment.
    async fn verdict(&self, device: &Device) -> HealthVerdict;
}

/// `smartctl`-backed probe.
#[derive(Debug, Clone)]
pub struct SmartctlProbe {
    program: String,
    use_sudo: bool,
    timeout: Duration,
}

impl SmartctlProbe {
    pub fn new(config: &StressConfig) -> Self {
        Self {
            program: config.tools.smartctl.clone(),
            use_sudo: config.tools.use_sudo,
            timeout: config.telemetry.query_timeout(),
        }
    }

    async fn query(&self, flag: &str, device: &Device) -> Result<String, HealthError> {
        let mut cmd = process::tool_command(&self.program, self.use_sudo);
        cmd.arg(flag).arg(&device.path);
        let output = process::output_with_timeout(cmd, self.timeout)
            .await
            .map_err(|source| HealthError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // smartctl encodes warnings in its exit status bitmask, so a non-zero
        // exit with output is still a usable report.
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if stdout.trim().is_empty() {
            return Err(HealthError::NoOutput {
                program: self.program.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if !output.status.success() {
            debug!(device = %device.name, code = ?output.status.code(), "health tool reported warnings");
        }
        Ok(stdout)
    }
}

#[async_trait]
impl HealthProbe for SmartctlProbe {
    async fn report(&self, device: &Device) -> Result<String, HealthError> {
        self.query("-a", device).await
    }

    async fn verdict(&self, device: &Device) -> HealthVerdict {
        match self.query("-H", device).await {
            Ok(text) => classify_verdict(&text),
            Err(e) => {
                debug!(device = %device.name, error = %e, "health verdict unavailable");
                HealthVerdict::Unknown
            }
        }
    }
}

/// Classify smartctl `-H` (or `-a`) output.
pub fn classify_verdict(text: &str) -> HealthVerdict {
    let lower = text.to_lowercase();
    if lower.contains("self-assessment test result: passed") || lower.contains("health status: ok") {
        HealthVerdict::Healthy
    } else if lower.contains("self-assessment test result: failed") {
        HealthVerdict::Failed
    } else {
        HealthVerdict::Unknown
    }
}

/// Lines of a health dump that carry a temperature reading.
pub fn temperature_lines(text: &str) -> Vec<&str> {
    text.lines()
        .map(str::trim)
        .filter(|l| l.contains("Temperature") && l.contains("Celsius"))
        .collect()
}

/// Every `<number> Celsius` reading in `line`.
pub fn celsius_readings(line: &str) -> Vec<f64> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    tokens
        .windows(2)
        .filter(|w| w[1].trim_end_matches(|c: char| !c.is_alphabetic()) == "Celsius")
        .filter_map(|w| w[0].trim_start_matches(|c: char| !c.is_ascii_digit() && c != '-').parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMART_NVME: &str = "\
smartctl 7.2 2020-12-30 r5155 [x86_64-linux-5.15.0] (local build)
=== START OF SMART DATA SECTION ===
SMART overall-health self-assessment test result: PASSED

SMART/Health Information (NVMe Log 0x02)
Critical Warning:                   0x00
Temperature:                        41 Celsius
Available Spare:                    100%
Percentage Used:                    0%
Warning  Comp. Temperature Time:    0
Critical Comp. Temperature Time:    0
Temperature Sensor 1:               41 Celsius
Temperature Sensor 2:               47 Celsius
";

    #[test]
    fn test_temperature_lines() {
        let lines = temperature_lines(SMART_NVME);
        assert_eq!(
            lines,
            vec![
                "Temperature:                        41 Celsius",
                "Temperature Sensor 1:               41 Celsius",
                "Temperature Sensor 2:               47 Celsius",
            ]
        );
        assert!(temperature_lines("no readings here").is_empty());
    }

    #[test]
    fn test_celsius_readings() {
        assert_eq!(celsius_readings("Temperature: 41 Celsius"), vec![41.0]);
        assert_eq!(
            celsius_readings("Temperature: 41 Celsius | Temperature Sensor 2: 47 Celsius"),
            vec![41.0, 47.0]
        );
        assert_eq!(celsius_readings("host 52.4 Celsius"), vec![52.4]);
        assert!(celsius_readings("Warning  Comp. Temperature Time: 0").is_empty());
    }

    #[test]
    fn test_classify_verdict() {
        assert_eq!(classify_verdict(SMART_NVME), HealthVerdict::Healthy);
        assert_eq!(
            classify_verdict("SMART overall-health self-assessment test result: FAILED!"),
            HealthVerdict::Failed
        );
        assert_eq!(classify_verdict("SMART Health Status: OK"), HealthVerdict::Healthy);
        assert_eq!(classify_verdict("Smartctl open device failed"), HealthVerdict::Unknown);
    }

    #[tokio::test]
    async fn test_missing_tool_is_an_error() {
        let mut cfg = StressConfig::default();
        cfg.tools.smartctl = "/nonexistent/smartctl".to_string();
        let probe = SmartctlProbe::new(&cfg);
        let dev = Device::new("nvme0n1", None, "X", crate::devices::MountState::Unmounted);
        assert!(matches!(probe.report(&dev).await, Err(HealthError::Spawn { .. })));
        assert_eq!(probe.verdict(&dev).await, HealthVerdict::Unknown);
    }
}
