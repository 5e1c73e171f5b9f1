//! Result aggregation: per-device summaries built from run logs, and an
//! overall report across devices.

pub mod parser;

use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};

use crate::health::HealthVerdict;
use crate::runlog::{self, LogError, LogRecord};

use self::parser::ParsedLog;

/// Derived metrics for one run log. Metrics the log does not contain are
/// `None`, never zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub log_name: String,
    pub device: String,
    pub workload: Option<String>,
    pub label: Option<String>,
    pub read_iops: Option<f64>,
    pub write_iops: Option<f64>,
    pub read_bw_mib: Option<f64>,
    pub write_bw_mib: Option<f64>,
    pub checkpoint_write_iops: Option<f64>,
    pub checkpoint_write_bw_mib: Option<f64>,
    pub max_temp_c: Option<f64>,
    pub temp_before_c: Option<f64>,
    pub temp_after_c: Option<f64>,
    pub samples: u64,
    pub error_log_entries: Option<u64>,
    pub health: HealthVerdict,
    pub end_state: Option<String>,
    pub exit_code: Option<i32>,
    pub elapsed_secs: Option<u64>,
    /// Names of the core metrics that were not found.
    pub missing: Vec<&'static str>,
    pub incomplete: bool,
    pub passed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OverallSummary {
    pub devices: usize,
    pub passed: usize,
    pub failed: usize,
    pub incomplete: usize,
    pub hottest_device: Option<String>,
    pub hottest_temp_c: Option<f64>,
    pub mean_read_bw_mib: Option<f64>,
    pub mean_write_bw_mib: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SummaryReport {
    pub devices: Vec<DeviceSummary>,
    pub overall: OverallSummary,
}

impl SummaryReport {
    pub fn from_summaries(devices: Vec<DeviceSummary>) -> Self {
        let overall = overall(&devices);
        Self { devices, overall }
    }
}

/// Summarize one run log. Pure: the same log always gives the same summary.
pub fn summarize(record: &LogRecord) -> DeviceSummary {
    let parsed = parser::parse(&record.text);
    build(&record.name, &parsed)
}

/// Summarize every run log in `dir`, in file-name order.
pub fn summarize_dir(dir: &Path) -> Result<SummaryReport, LogError> {
    let mut names: Vec<String> = runlog::list_logs(dir)?
        .into_iter()
        .map(|l| l.name)
        .filter(|n| n != runlog::SYSTEM_TELEMETRY_LOG)
        .collect();
    names.sort();

    let mut devices = Vec::with_capacity(names.len());
    for name in &names {
        match runlog::read_log(dir, name) {
            Ok(record) => devices.push(summarize(&record)),
            Err(e) => warn!(log = %name, error = %e, "skipping unreadable log"),
        }
    }
    debug!(logs = devices.len(), "summarized log directory");
    Ok(SummaryReport::from_summaries(devices))
}

fn build(log_name: &str, p: &ParsedLog) -> DeviceSummary {
    let group0 = p.groups.get(&0).copied().unwrap_or_default();
    let group1 = p.groups.get(&1).copied().unwrap_or_default();

    let read_iops = p.read.map(|io| io.iops);
    let write_iops = p.write.map(|io| io.iops);
    let read_bw_mib = group0.read_mib.or_else(|| p.read.and_then(|io| io.bw_mib));
    let write_bw_mib = group0.write_mib.or_else(|| p.write.and_then(|io| io.bw_mib));

    let after = p.after.as_ref();
    let before = p.before.as_ref();
    let health = match (after.map(|s| s.verdict), before.map(|s| s.verdict)) {
        (Some(v), _) if v != HealthVerdict::Unknown => v,
        (_, Some(v)) => v,
        (Some(v), None) => v,
        (None, None) => HealthVerdict::Unknown,
    };
    let error_log_entries = after
        .and_then(|s| s.error_log_entries)
        .or_else(|| before.and_then(|s| s.error_log_entries));

    let mut missing = Vec::new();
    for (name, present) in [
        ("read_iops", read_iops.is_some()),
        ("write_iops", write_iops.is_some()),
        ("read_bw", read_bw_mib.is_some()),
        ("write_bw", write_bw_mib.is_some()),
        ("max_temp", p.max_temp_c.is_some()),
        ("end", p.end.is_some()),
    ] {
        if !present {
            missing.push(name);
        }
    }
    let incomplete = !missing.is_empty();

    let end_state = p.end.as_ref().map(|e| e.state.clone());
    let exit_code = p.end.as_ref().and_then(|e| e.exit_code);
    let passed = !incomplete
        && end_state.as_deref() == Some("completed")
        && exit_code == Some(0)
        && health != HealthVerdict::Failed
        && error_log_entries.unwrap_or(0) == 0;

    DeviceSummary {
        log_name: log_name.to_string(),
        device: device_name(log_name, p),
        workload: p.header.get("workload").cloned(),
        label: p.header.get("label").filter(|l| l.as_str() != "-").cloned(),
        read_iops,
        write_iops,
        read_bw_mib,
        write_bw_mib,
        checkpoint_write_iops: p.checkpoint_write.map(|io| io.iops),
        checkpoint_write_bw_mib: group1.write_mib.or_else(|| p.checkpoint_write.and_then(|io| io.bw_mib)),
        max_temp_c: p.max_temp_c,
        temp_before_c: before.and_then(|s| s.temperature_c),
        temp_after_c: after.and_then(|s| s.temperature_c),
        samples: p.samples,
        error_log_entries,
        health,
        end_state,
        exit_code,
        elapsed_secs: p.end.as_ref().and_then(|e| e.elapsed_secs),
        missing,
        incomplete,
        passed,
    }
}

/// Device from the header, else from a `..nvme_stress_<device>_<date>_<time>.log` name.
fn device_name(log_name: &str, p: &ParsedLog) -> String {
    if let Some(path) = p.header.get("device") {
        return path.strip_prefix("/dev/").unwrap_or(path).to_string();
    }
    log_name
        .find("nvme_stress_")
        .map(|i| &log_name[i + "nvme_stress_".len()..])
        .and_then(|rest| rest.trim_end_matches(".log").rsplitn(3, '_').nth(2))
        .unwrap_or(log_name)
        .to_string()
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn overall(devices: &[DeviceSummary]) -> OverallSummary {
    let passed = devices.iter().filter(|d| d.passed).count();
    let incomplete = devices.iter().filter(|d| d.incomplete).count();
    let hottest = devices
        .iter()
        .filter_map(|d| d.max_temp_c.map(|t| (d, t)))
        .max_by(|a, b| a.1.total_cmp(&b.1));

    OverallSummary {
        devices: devices.len(),
        passed,
        failed: devices.len() - passed - incomplete,
        incomplete,
        hottest_device: hottest.map(|(d, _)| d.device.clone()),
        hottest_temp_c: hottest.map(|(_, t)| t),
        mean_read_bw_mib: mean(devices.iter().filter_map(|d| d.read_bw_mib)),
        mean_write_bw_mib: mean(devices.iter().filter_map(|d| d.write_bw_mib)),
    }
}
