//! Single-pass scanner over a run log.
//!
//! Understands the run log framing (header, health brackets, `[TEMP]`
//! samples, `[END]`) and the parts of fio's human-readable output we report
//! on: per-job `read:`/`write:` IOPS lines and `Run status group` bandwidth
//! lines.

use std::collections::BTreeMap;

use crate::health::{self, HealthVerdict};
use crate::runlog::{END_TAG, HEALTH_AFTER, HEALTH_BEFORE, HEALTH_END, RUN_HEADER};
use crate::telemetry::TEMP_TAG;
use crate::workload::fio::AI_CHECKPOINT;

/// IOPS and bandwidth from one `read:`/`write:` line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IoLine {
    pub iops: f64,
    pub bw_mib: Option<f64>,
}

/// Run status bandwidth for one group, MiB/s.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GroupBandwidth {
    pub read_mib: Option<f64>,
    pub write_mib: Option<f64>,
}

/// What one health bracket says.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub temperature_c: Option<f64>,
    pub error_log_entries: Option<u64>,
    pub verdict: HealthVerdict,
}

/// Terminal record of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndRecord {
    pub state: String,
    pub exit_code: Option<i32>,
    pub elapsed_secs: Option<u64>,
}

/// Everything extracted from one log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedLog {
    /// `key=value` pairs of the header line.
    pub header: BTreeMap<String, String>,
    pub before: Option<HealthSnapshot>,
    pub after: Option<HealthSnapshot>,
    /// Last `read:` line outside the checkpoint phase.
    pub read: Option<IoLine>,
    /// Last `write:` line outside the checkpoint phase.
    pub write: Option<IoLine>,
    /// Last `write:` line of the checkpoint phase.
    pub checkpoint_write: Option<IoLine>,
    /// Run status bandwidth by group id, last occurrence wins.
    pub groups: BTreeMap<u32, GroupBandwidth>,
    pub samples: u64,
    pub max_temp_c: Option<f64>,
    pub end: Option<EndRecord>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Body,
    Before,
    After,
}

/// Scan a whole log.
pub fn parse(text: &str) -> ParsedLog {
    let mut parsed = ParsedLog::default();
    let mut section = Section::Body;
    let mut before = String::new();
    let mut after = String::new();
    let mut job: Option<String> = None;
    let mut group: Option<u32> = None;

    for raw in text.lines() {
        let line = raw.trim();

        match line {
            HEALTH_BEFORE => {
                section = Section::Before;
                before.clear();
                continue;
            }
            HEALTH_AFTER => {
                section = Section::After;
                after.clear();
                continue;
            }
            HEALTH_END => {
                match section {
                    Section::Before => parsed.before = Some(snapshot(&before)),
                    Section::After => parsed.after = Some(snapshot(&after)),
                    Section::Body => {}
                }
                section = Section::Body;
                continue;
            }
            _ => {}
        }

        match section {
            Section::Before => {
                before.push_str(line);
                before.push('\n');
                continue;
            }
            Section::After => {
                after.push_str(line);
                after.push('\n');
                continue;
            }
            Section::Body => {}
        }

        if let Some(rest) = line.strip_prefix(RUN_HEADER) {
            parsed.header = key_values(rest.trim_end_matches('=').trim());
        } else if let Some(rest) = line.strip_prefix(TEMP_TAG) {
            if !rest.starts_with(' ') {
                continue;
            }
            parsed.samples += 1;
            for c in health::celsius_readings(rest) {
                parsed.max_temp_c = Some(parsed.max_temp_c.map_or(c, |m: f64| m.max(c)));
            }
        } else if let Some(rest) = line.strip_prefix(END_TAG) {
            parsed.end = Some(end_record(rest));
        } else if let Some(name) = job_header(raw) {
            job = Some(name);
        } else if let Some(rest) = line.strip_prefix("read:") {
            if let Some(io) = io_line(rest) {
                parsed.read = Some(io);
            }
        } else if let Some(rest) = line.strip_prefix("write:") {
            if let Some(io) = io_line(rest) {
                if job.as_deref() == Some(AI_CHECKPOINT.name) {
                    parsed.checkpoint_write = Some(io);
                } else {
                    parsed.write = Some(io);
                }
            }
        } else if let Some(rest) = line.strip_prefix("Run status group ") {
            group = rest.split_whitespace().next().and_then(|g| g.parse().ok());
        } else if let Some(rest) = line.strip_prefix("READ:") {
            if let (Some(g), Some(bw)) = (group, status_bandwidth(rest)) {
                parsed.groups.entry(g).or_default().read_mib = Some(bw);
            }
        } else if let Some(rest) = line.strip_prefix("WRITE:") {
            if let (Some(g), Some(bw)) = (group, status_bandwidth(rest)) {
                parsed.groups.entry(g).or_default().write_mib = Some(bw);
            }
        }
    }

    parsed
}

/// `ai_data_load: (groupid=0, jobs=8): err= 0: ...` -> `ai_data_load`.
fn job_header(raw: &str) -> Option<String> {
    if raw.starts_with(char::is_whitespace) {
        return None;
    }
    let idx = raw.find(": (groupid=")?;
    Some(raw[..idx].to_string())
}

fn snapshot(text: &str) -> HealthSnapshot {
    let temperature_c = text
        .lines()
        .find(|l| l.starts_with("Temperature:"))
        .and_then(|l| health::celsius_readings(l).into_iter().next());
    let error_log_entries = text
        .lines()
        .find_map(|l| l.strip_prefix("Error Information Log Entries:"))
        .and_then(|v| v.trim().replace(',', "").parse().ok());
    HealthSnapshot {
        temperature_c,
        error_log_entries,
        verdict: health::classify_verdict(text),
    }
}

/// `key=value` pairs separated by whitespace. Values may be double quoted
/// with backslash escapes (`label="bay 2"`); bare words are skipped.
fn key_values(text: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let mut rest = text.trim_start();
    while !rest.is_empty() {
        let word_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let Some(eq) = rest[..word_end].find('=') else {
            rest = rest[word_end..].trim_start();
            continue;
        };
        let key = &rest[..eq];
        let tail = &rest[eq + 1..];
        let (value, next) = match tail.strip_prefix('"') {
            Some(quoted) => unquote(quoted),
            None => {
                let end = tail.find(char::is_whitespace).unwrap_or(tail.len());
                (tail[..end].to_string(), &tail[end..])
            }
        };
        out.insert(key.to_string(), value);
        rest = next.trim_start();
    }
    out
}

fn unquote(text: &str) -> (String, &str) {
    let mut value = String::new();
    let mut chars = text.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return (value, &text[i + 1..]),
            '\\' => {
                if let Some((_, escaped)) = chars.next() {
                    value.push(escaped);
                }
            }
            c => value.push(c),
        }
    }
    (value, "")
}

fn end_record(rest: &str) -> EndRecord {
    let kv = key_values(rest);
    EndRecord {
        state: kv.get("state").cloned().unwrap_or_default(),
        exit_code: kv.get("exit_code").and_then(|v| v.parse().ok()),
        elapsed_secs: kv
            .get("elapsed")
            .and_then(|v| v.trim_end_matches('s').parse().ok()),
    }
}

/// ` IOPS=20.5k, BW=2566MiB/s (2690MB/s)(1503GiB/600001msec)`
fn io_line(rest: &str) -> Option<IoLine> {
    let iops_text = rest.trim().strip_prefix("IOPS=")?;
    let iops = parse_count(iops_text.split(',').next()?.trim())?;
    let bw_mib = rest
        .find("BW=")
        .map(|i| &rest[i + 3..])
        .and_then(|s| s.split(|c: char| c.is_whitespace() || c == '(').next())
        .and_then(parse_bandwidth);
    Some(IoLine { iops, bw_mib })
}

/// ` bw=2566MiB/s (2690MB/s), 2566MiB/s-2566MiB/s ..., io=1503GiB ...`
fn status_bandwidth(rest: &str) -> Option<f64> {
    let value = rest.trim().strip_prefix("bw=")?;
    parse_bandwidth(value.split(|c: char| c.is_whitespace() || c == ',' || c == '(').next()?)
}

/// `8797`, `20.5k`, `1.2M`.
pub fn parse_count(text: &str) -> Option<f64> {
    let (number, scale) = match text.chars().last()? {
        'k' | 'K' => (&text[..text.len() - 1], 1e3),
        'M' => (&text[..text.len() - 1], 1e6),
        'G' => (&text[..text.len() - 1], 1e9),
        _ => (text, 1.0),
    };
    let n: f64 = number.parse().ok()?;
    // fio prints scaled counts with at most two decimals
    Some(if scale > 1.0 { (n * scale).round() } else { n })
}

/// A fio rate such as `2566MiB/s`, `850kB/s` or `3.1GiB/s`, in MiB/s.
pub fn parse_bandwidth(text: &str) -> Option<f64> {
    let text = text.trim().strip_suffix("/s")?;
    let split = text.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
    let (number, unit) = text.split_at(split);
    let value: f64 = number.parse().ok()?;
    let bytes_per_unit = match unit {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => return None,
    };
    Some(value * bytes_per_unit / (1024.0 * 1024.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    const AI_LOG: &str = "\
=== nvme-stress run device=/dev/nvme0n1 workload=ai duration=600s label=bay3 started=2026-10-17T09:05:03Z ===
=== HEALTH BEFORE TEST ===
smartctl 7.4 2023-08-01 r5530 [x86_64-linux-6.8.0] (local build)
=== START OF SMART DATA SECTION ===
SMART overall-health self-assessment test result: PASSED
Temperature:                        38 Celsius
Error Information Log Entries:      0
=== END HEALTH ===
ai_data_load: (g=0): rw=randrw, bs=(R) 128KiB-128KiB, (W) 128KiB-128KiB, ioengine=libaio, iodepth=32
[TEMP] 2026-10-17T09:05:04Z nvme0n1 Temperature: 41 Celsius | Temperature Sensor 1: 44 Celsius
ai_data_load: (groupid=0, jobs=8): err= 0: pid=4242: Fri Oct 17 09:12:33 2026
  read: IOPS=20.5k, BW=2566MiB/s (2690MB/s)(1128GiB/450001msec)
  write: IOPS=8797, BW=1100MiB/s (1153MB/s)(483GiB/450001msec); 0 zone resets
[TEMP] 2026-10-17T09:10:04Z nvme0n1 Temperature: 57 Celsius | Temperature Sensor 1: 61 Celsius
ai_model_checkpoint: (groupid=1, jobs=4): err= 0: pid=4251: Fri Oct 17 09:15:03 2026
  write: IOPS=8300, BW=8300MiB/s (8703MB/s)(1216GiB/150001msec); 0 zone resets
[TEMP-MISS] 2026-10-17T09:14:04Z nvme0n1 no temperature reading in health output

Run status group 0 (all jobs):
   READ: bw=2566MiB/s (2690MB/s), 2566MiB/s-2566MiB/s (2690MB/s-2690MB/s), io=1128GiB (1211GB), run=450001-450001msec
  WRITE: bw=1100MiB/s (1153MB/s), 1100MiB/s-1100MiB/s (1153MB/s-1153MB/s), io=483GiB (519GB), run=450001-450001msec

Run status group 1 (all jobs):
  WRITE: bw=8300MiB/s (8703MB/s), 8300MiB/s-8300MiB/s (8703MB/s-8703MB/s), io=1216GiB (1305GB), run=150001-150001msec

Disk stats (read/write):
  nvme0n1: ios=9216000/7437000, merge=0/0, ticks=1/2, in_queue=3, util=99.91%
=== HEALTH AFTER TEST ===
SMART overall-health self-assessment test result: PASSED
Temperature:                        52 Celsius
Error Information Log Entries:      2
=== END HEALTH ===
[END] state=completed exit_code=0 elapsed=601s
";

    #[test]
    fn test_parse_ai_log() {
        let p = parse(AI_LOG);
        assert_eq!(p.header.get("device").map(String::as_str), Some("/dev/nvme0n1"));
        assert_eq!(p.header.get("workload").map(String::as_str), Some("ai"));
        assert_eq!(p.header.get("label").map(String::as_str), Some("bay3"));

        assert_eq!(p.read, Some(IoLine { iops: 20_500.0, bw_mib: Some(2566.0) }));
        assert_eq!(p.write, Some(IoLine { iops: 8797.0, bw_mib: Some(1100.0) }));
        assert_eq!(p.checkpoint_write, Some(IoLine { iops: 8300.0, bw_mib: Some(8300.0) }));
        assert_eq!(p.groups[&0].read_mib, Some(2566.0));
        assert_eq!(p.groups[&0].write_mib, Some(1100.0));
        assert_eq!(p.groups[&1].write_mib, Some(8300.0));
        assert_eq!(p.groups[&1].read_mib, None);

        assert_eq!(p.samples, 2);
        assert_eq!(p.max_temp_c, Some(61.0));

        let before = p.before.unwrap();
        assert_eq!(before.temperature_c, Some(38.0));
        assert_eq!(before.error_log_entries, Some(0));
        assert_eq!(before.verdict, HealthVerdict::Healthy);
        let after = p.after.unwrap();
        assert_eq!(after.temperature_c, Some(52.0));
        assert_eq!(after.error_log_entries, Some(2));

        assert_eq!(
            p.end,
            Some(EndRecord {
                state: "completed".to_string(),
                exit_code: Some(0),
                elapsed_secs: Some(601),
            })
        );
    }

    #[test]
    fn test_last_io_line_wins() {
        let text = "\
standard_randrw: (groupid=0, jobs=4): err= 0: pid=1
  read: IOPS=100, BW=400KiB/s (410kB/s)(4000KiB/10001msec)
  write: IOPS=99, BW=396KiB/s (406kB/s)(3960KiB/10001msec); 0 zone resets
standard_randrw: (groupid=0, jobs=4): err= 0: pid=2
  read: IOPS=1.2M, BW=4688MiB/s (4915MB/s)(45.8GiB/10001msec)
";
        let p = parse(text);
        assert!((p.read.unwrap().iops - 1_200_000.0).abs() < 1e-6);
        assert_eq!(p.write.unwrap().iops, 99.0);
        assert!(p.checkpoint_write.is_none());
        assert!((p.write.unwrap().bw_mib.unwrap() - 396.0 / 1024.0).abs() < 1e-9);
    }

    #[test]
    fn test_truncated_log() {
        let text = "\
=== HEALTH BEFORE TEST ===
Temperature:                        38 Celsius
";
        let p = parse(text);
        assert!(p.before.is_none());
        assert!(p.read.is_none());
        assert!(p.end.is_none());
        assert_eq!(p.samples, 0);
        assert_eq!(p.max_temp_c, None);
    }

    #[test]
    fn test_quoted_header_values() {
        let p = parse(
            "=== nvme-stress run device=/dev/nvme2n1 workload=standard duration=60s label=\"bay 2 \\\"left\\\"\" started=2026-10-17T09:05:03Z ===\n",
        );
        assert_eq!(p.header.get("label").map(String::as_str), Some("bay 2 \"left\""));
        assert_eq!(p.header.get("started").map(String::as_str), Some("2026-10-17T09:05:03Z"));
        assert_eq!(p.header.get("duration").map(String::as_str), Some("60s"));

        let kv = key_values("stray state=failed reason=\"a b=c\" elapsed=3s");
        assert_eq!(kv.get("reason").map(String::as_str), Some("a b=c"));
        assert_eq!(kv.get("elapsed").map(String::as_str), Some("3s"));
        assert!(!kv.contains_key("stray"));
    }

    #[test]
    fn test_end_record_variants() {
        let p = parse("[END] state=failed elapsed=0s reason=\"failed to start workload fio: No such file\"\n");
        let end = p.end.unwrap();
        assert_eq!(end.state, "failed");
        assert_eq!(end.exit_code, None);
        assert_eq!(end.elapsed_secs, Some(0));

        let p = parse("[END] state=completed exit_code=signal elapsed=12s\n");
        assert_eq!(p.end.unwrap().exit_code, None);
    }

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_count("8797"), Some(8797.0));
        assert_eq!(parse_count("20.5k"), Some(20_500.0));
        assert_eq!(parse_count("abc"), None);

        assert_eq!(parse_bandwidth("2566MiB/s"), Some(2566.0));
        assert_eq!(parse_bandwidth("3GiB/s"), Some(3072.0));
        assert_eq!(parse_bandwidth("512KiB/s"), Some(0.5));
        assert!((parse_bandwidth("1000kB/s").unwrap() - 0.95367431640625).abs() < 1e-12);
        assert_eq!(parse_bandwidth("2566MiB"), None);
        assert_eq!(parse_bandwidth("fast/s"), None);
    }
}
