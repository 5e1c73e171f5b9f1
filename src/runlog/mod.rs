//! Per-run log files: one append-only text file per test run.
//!
//! The writer side is a cloneable [`LogSink`] shared by the workload output
//! pumps and the telemetry sampler of one run. Readers (live viewers, the
//! report builder) open the file independently.

use std::fs::{File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use thiserror::Error;

/// Name of the host-wide telemetry log inside the log directory.
pub const SYSTEM_TELEMETRY_LOG: &str = "system_telemetry.log";

/// First words of the header line of every run log.
pub const RUN_HEADER: &str = "=== nvme-stress run";
pub const HEALTH_BEFORE: &str = "=== HEALTH BEFORE TEST ===";
pub const HEALTH_AFTER: &str = "=== HEALTH AFTER TEST ===";
pub const HEALTH_END: &str = "=== END HEALTH ===";
/// Tag of the final line of a finished run.
pub const END_TAG: &str = "[END]";

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid log name {0:?}")]
    InvalidName(String),

    #[error("log {0:?} not found")]
    NotFound(String),

    #[error("log sink is closed")]
    Closed,
}

enum Backend {
    File(LineWriter<File>),
    Memory(Vec<String>),
}

struct SinkInner {
    backend: Backend,
    lines: usize,
    closed: bool,
}

/// Append-only line sink.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<Mutex<SinkInner>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("path", &self.path)
            .field("lines", &self.len())
            .finish()
    }
}

impl LogSink {
    /// Create a new file. Fails if `path` already exists.
    pub fn create(path: &Path) -> Result<Self, LogError> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        Ok(Self::with_backend(Backend::File(LineWriter::new(file)), Some(path.to_path_buf())))
    }

    /// Open `path` for appending, creating it when missing.
    pub fn append_to(path: &Path) -> Result<Self, LogError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::with_backend(Backend::File(LineWriter::new(file)), Some(path.to_path_buf())))
    }

    /// In-memory sink.
    pub fn memory() -> Self {
        Self::with_backend(Backend::Memory(Vec::new()), None)
    }

    fn with_backend(backend: Backend, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SinkInner {
                backend,
                lines: 0,
                closed: false,
            })),
            path,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append `text`, one record per line. An empty `text` is one empty line.
    pub fn append(&self, text: &str) -> Result<(), LogError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(LogError::Closed);
        }
        for line in text.lines().chain(text.is_empty().then_some("")) {
            match &mut inner.backend {
                Backend::File(w) => writeln!(w, "{}", line)?,
                Backend::Memory(v) => v.push(line.to_string()),
            }
            inner.lines += 1;
        }
        Ok(())
    }

    /// Number of lines appended so far.
    pub fn len(&self) -> usize {
        self.lock().lines
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject every later append and flush.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        if let Backend::File(w) = &mut inner.backend {
            let _ = w.flush();
        }
    }

    /// Current contents. Reads the file back for file-backed sinks.
    pub fn contents(&self) -> Result<String, LogError> {
        {
            let mut inner = self.lock();
            match &mut inner.backend {
                Backend::Memory(v) => {
                    let mut s = v.join("\n");
                    if !v.is_empty() {
                        s.push('\n');
                    }
                    return Ok(s);
                }
                Backend::File(w) => w.flush()?,
            }
        }
        match &self.path {
            Some(path) => Ok(std::fs::read_to_string(path)?),
            None => Ok(String::new()),
        }
    }
}

/// A completed (or in-progress) run log, read back as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub name: String,
    pub text: String,
}

impl LogRecord {
    pub fn new(name: &str, text: &str) -> Self {
        Self {
            name: name.to_string(),
            text: text.to_string(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, LogError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bytes = std::fs::read(path)?;
        Ok(Self {
            name,
            text: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.lines()
    }
}

/// Listing entry for a log file.
#[derive(Debug, Clone, Serialize)]
pub struct LogInfo {
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Keep `[A-Za-z0-9_-]`, replace everything else with `_`.
pub fn sanitize_label(label: &str) -> String {
    label
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Deterministic log file name for a run.
pub fn log_file_name(device: &str, label: Option<&str>, started: DateTime<Local>) -> String {
    let stamp = started.format("%Y%m%d_%H%M%S");
    match label.map(sanitize_label).filter(|l| !l.is_empty()) {
        Some(label) => format!("{}_nvme_stress_{}_{}.log", label, device, stamp),
        None => format!("nvme_stress_{}_{}.log", device, stamp),
    }
}

/// Create the log file for a new run, never reusing an existing file.
pub fn create_run_log(
    dir: &Path,
    device: &str,
    label: Option<&str>,
    started: DateTime<Local>,
) -> Result<LogSink, LogError> {
    std::fs::create_dir_all(dir)?;
    let base = log_file_name(device, label, started);
    let stem = base.trim_end_matches(".log").to_string();
    let mut n = 0u32;
    loop {
        let candidate = if n == 0 {
            dir.join(&base)
        } else {
            dir.join(format!("{}-{}.log", stem, n))
        };
        match LogSink::create(&candidate) {
            Err(LogError::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists && n < 1000 => n += 1,
            other => return other,
        }
    }
}

/// Log files in `dir`, newest first.
pub fn list_logs(dir: &Path) -> Result<Vec<LogInfo>, LogError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut logs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
        logs.push(LogInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            size: meta.len(),
            modified,
        });
    }
    logs.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.name.cmp(&b.name)));
    Ok(logs)
}

/// Read one log by file name. Names that could escape `dir` are rejected.
pub fn read_log(dir: &Path, name: &str) -> Result<LogRecord, LogError> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || !name.ends_with(".log")
    {
        return Err(LogError::InvalidName(name.to_string()));
    }
    let path = dir.join(name);
    if !path.is_file() {
        return Err(LogError::NotFound(name.to_string()));
    }
    LogRecord::load(&path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn started() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 10, 17, 9, 5, 3).unwrap()
    }

    #[test]
    fn test_log_file_name() {
        assert_eq!(
            log_file_name("nvme0n1", None, started()),
            "nvme_stress_nvme0n1_20261017_090503.log"
        );
        assert_eq!(
            log_file_name("nvme0n1", Some("rack 4/slot#2"), started()),
            "rack_4_slot_2_nvme_stress_nvme0n1_20261017_090503.log"
        );
        assert_eq!(
            log_file_name("nvme0n1", Some("   "), started()),
            "nvme_stress_nvme0n1_20261017_090503.log"
        );
    }

    #[test]
    fn test_memory_sink_append_and_close() {
        let sink = LogSink::memory();
        sink.append("one\ntwo").unwrap();
        sink.append("").unwrap();
        sink.append("three").unwrap();
        assert_eq!(sink.len(), 4);
        sink.close();
        assert!(matches!(sink.append("four"), Err(LogError::Closed)));
        assert_eq!(sink.len(), 4);
        assert_eq!(sink.contents().unwrap(), "one\ntwo\n\nthree\n");
    }

    #[test]
    fn test_create_run_log_never_reuses_a_name() {
        let dir = tempfile::tempdir().unwrap();
        let a = create_run_log(dir.path(), "nvme1n1", None, started()).unwrap();
        let b = create_run_log(dir.path(), "nvme1n1", None, started()).unwrap();
        assert_ne!(a.path(), b.path());
        assert!(b
            .path()
            .unwrap()
            .to_string_lossy()
            .ends_with("nvme_stress_nvme1n1_20261017_090503-1.log"));

        a.append("hello").unwrap();
        assert_eq!(a.contents().unwrap(), "hello\n");
    }

    #[test]
    fn test_list_and_read_logs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.log"), "alpha\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "skip").unwrap();

        let logs = list_logs(dir.path()).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].name, "a.log");
        assert_eq!(logs[0].size, 6);

        let record = read_log(dir.path(), "a.log").unwrap();
        assert_eq!(record.lines().collect::<Vec<_>>(), vec!["alpha"]);

        assert!(matches!(read_log(dir.path(), "../etc/passwd.log"), Err(LogError::InvalidName(_))));
        assert!(matches!(read_log(dir.path(), "notes.txt"), Err(LogError::InvalidName(_))));
        assert!(matches!(read_log(dir.path(), "b.log"), Err(LogError::NotFound(_))));
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        assert!(list_logs(Path::new("/nonexistent/nvme-stress-logs")).unwrap().is_empty());
    }
}
