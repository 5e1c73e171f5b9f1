//! Workload runner: one fio process per device, supervised until it exits or
//! the run is cancelled.

pub mod fio;

use std::fmt;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StressConfig;
use crate::devices::Device;
use crate::orchestrator::TestRequest;
use crate::runlog::LogSink;
use crate::system::process;

use self::fio::FioJob;

/// How long output pumps may keep draining after the process is gone.
const PUMP_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to start workload {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    /// Data-load phase followed by a checkpoint phase.
    #[serde(rename = "ai", alias = "ai-simulated")]
    AiSimulated,
    /// Single mixed random phase.
    #[serde(rename = "standard", alias = "standard-random")]
    StandardRandom,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::AiSimulated => write!(f, "ai"),
            WorkloadKind::StandardRandom => write!(f, "standard"),
        }
    }
}

impl FromStr for WorkloadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ai" | "ai-simulated" => Ok(WorkloadKind::AiSimulated),
            "standard" | "standard-random" => Ok(WorkloadKind::StandardRandom),
            other => Err(format!("unknown workload kind '{}' (expected 'ai' or 'standard')", other)),
        }
    }
}

/// How a workload process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadExit {
    /// Exited on its own. `code` is `None` when killed by a signal.
    Exited { code: Option<i32> },
    /// Terminated because the run was cancelled.
    Cancelled,
}

impl WorkloadExit {
    pub fn success(&self) -> bool {
        matches!(self, WorkloadExit::Exited { code: Some(0) })
    }
}

#[derive(Debug, Clone)]
pub struct WorkloadRunner {
    program: String,
    use_sudo: bool,
    ioengine: String,
    stop_grace: Duration,
    checkpoint_share_percent: u8,
}

impl WorkloadRunner {
    pub fn new(config: &StressConfig) -> Self {
        Self {
            program: config.tools.fio.clone(),
            use_sudo: config.tools.use_sudo,
            ioengine: config.workload.ioengine.clone(),
            stop_grace: config.workload.stop_grace(),
            checkpoint_share_percent: config.workload.checkpoint_share_percent,
        }
    }

    pub fn job(&self, device: &Device, request: &TestRequest) -> FioJob {
        FioJob {
            device_path: device.path.clone(),
            kind: request.workload,
            duration_secs: request.duration_secs,
            ioengine: self.ioengine.clone(),
            checkpoint_share_percent: self.checkpoint_share_percent,
        }
    }

    /// Spawn the workload process in its own process group.
    pub fn launch(&self, device: &Device, request: &TestRequest) -> Result<WorkloadProcess, LaunchError> {
        let job = self.job(device, request);
        let mut cmd = process::tool_command(&self.program, self.use_sudo);
        cmd.args(job.args())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        info!(
            device = %device.name,
            workload = %request.workload,
            duration_secs = request.duration_secs,
            pid = child.id(),
            "workload started"
        );
        Ok(WorkloadProcess {
            child,
            device: device.name.clone(),
            stop_grace: self.stop_grace,
        })
    }

    /// Launch and supervise to completion.
    pub async fn run(
        &self,
        device: &Device,
        request: &TestRequest,
        sink: &LogSink,
        cancel: &CancellationToken,
    ) -> Result<WorkloadExit, LaunchError> {
        let process = self.launch(device, request)?;
        Ok(process.supervise(sink, cancel).await)
    }
}

/// A launched workload that has not been supervised yet.
pub struct WorkloadProcess {
    child: Child,
    device: String,
    stop_grace: Duration,
}

impl WorkloadProcess {
    /// Copy stdout/stderr into `sink` line by line until the process exits,
    /// terminating it if `cancel` fires first. Once this returns, nothing
    /// more is written to `sink`.
    pub async fn supervise(mut self, sink: &LogSink, cancel: &CancellationToken) -> WorkloadExit {
        let mut pumps = Vec::new();
        if let Some(stdout) = self.child.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, sink.clone())));
        }
        if let Some(stderr) = self.child.stderr.take() {
            pumps.push(tokio::spawn(pump(stderr, sink.clone())));
        }

        let exit = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!(device = %self.device, "cancelling workload");
                let status = process::terminate_group(&mut self.child, self.stop_grace).await;
                debug!(device = %self.device, exit_code = ?status.and_then(|s| s.code()), "workload terminated");
                WorkloadExit::Cancelled
            }

            status = self.child.wait() => match status {
                Ok(status) => {
                    info!(device = %self.device, exit_code = ?status.code(), "workload exited");
                    WorkloadExit::Exited { code: status.code() }
                }
                Err(e) => {
                    warn!(device = %self.device, error = %e, "failed to wait for workload");
                    WorkloadExit::Exited { code: None }
                }
            },
        };

        for handle in pumps {
            drain(handle, &self.device).await;
        }
        exit
    }
}

async fn pump<R>(stream: R, sink: LogSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                if let Err(e) = sink.append(line.trim_end_matches(['\n', '\r'])) {
                    warn!(error = %e, "failed to write workload output");
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to read workload output");
                break;
            }
        }
    }
}

/// Wait for an output pump, aborting it if a leftover grandchild keeps the
/// pipe open.
async fn drain(mut handle: JoinHandle<()>, device: &str) {
    if tokio::time::timeout(PUMP_DRAIN, &mut handle).await.is_err() {
        warn!(device = %device, "workload output still open after exit, abandoning it");
        handle.abort();
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_kind_parse() {
        assert_eq!("ai".parse::<WorkloadKind>().unwrap(), WorkloadKind::AiSimulated);
        assert_eq!("Standard".parse::<WorkloadKind>().unwrap(), WorkloadKind::StandardRandom);
        assert_eq!(
            "standard-random".parse::<WorkloadKind>().unwrap(),
            WorkloadKind::StandardRandom
        );
        assert!("seq".parse::<WorkloadKind>().is_err());
        assert_eq!(WorkloadKind::AiSimulated.to_string(), "ai");
    }

    #[test]
    fn test_workload_kind_serde() {
        let k: WorkloadKind = serde_json::from_str("\"standard\"").unwrap();
        assert_eq!(k, WorkloadKind::StandardRandom);
        assert_eq!(serde_json::to_string(&WorkloadKind::AiSimulated).unwrap(), "\"ai\"");
    }

    #[cfg(unix)]
    mod runs {
        use super::super::*;
        use crate::devices::MountState;
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;
        use std::time::Instant;

        /// A stand-in for fio that ignores its arguments.
        fn runner(dir: &Path, body: &str) -> WorkloadRunner {
            let path = dir.join("fio");
            {
                let mut f = std::fs::File::create(&path).unwrap();
                write!(f, "#!/bin/sh\n{}\n", body).unwrap();
                f.sync_all().unwrap();
            }
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

            let mut config = StressConfig::default();
            config.tools.fio = path.to_string_lossy().into_owned();
            config.workload.stop_grace_secs = 1;
            WorkloadRunner::new(&config)
        }

        fn device() -> Device {
            Device::new("nvme1n1", None, "Test", MountState::Unmounted)
        }

        fn request() -> TestRequest {
            TestRequest::new("nvme1n1", 10, WorkloadKind::StandardRandom)
        }

        #[tokio::test]
        async fn test_run_captures_stdout_and_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let runner = runner(dir.path(), "echo 'read: IOPS=100'\necho\necho 'write: IOPS=99'\necho 'fio: warning' >&2");
            let sink = LogSink::memory();

            let exit = runner
                .run(&device(), &request(), &sink, &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(exit, WorkloadExit::Exited { code: Some(0) });

            let text = sink.contents().unwrap();
            let lines: Vec<_> = text.lines().collect();
            assert_eq!(lines.len(), 4, "{:?}", lines);
            assert!(lines.contains(&"fio: warning"));
            let stdout: Vec<_> = lines.iter().filter(|l| **l != "fio: warning").collect();
            assert_eq!(stdout, vec![&"read: IOPS=100", &"", &"write: IOPS=99"]);
        }

        #[tokio::test]
        async fn test_run_reports_exit_code() {
            let dir = tempfile::tempdir().unwrap();
            let runner = runner(dir.path(), "echo 'fio: bad option' >&2\nexit 3");
            let sink = LogSink::memory();

            let exit = runner
                .run(&device(), &request(), &sink, &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(exit, WorkloadExit::Exited { code: Some(3) });
            assert_eq!(sink.contents().unwrap(), "fio: bad option\n");
        }

        #[tokio::test]
        async fn test_run_cancel_terminates_the_process() {
            let dir = tempfile::tempdir().unwrap();
            let runner = runner(dir.path(), "echo started\nsleep 30\necho finished");
            let sink = LogSink::memory();
            let cancel = CancellationToken::new();

            let started = Instant::now();
            let task = {
                let sink = sink.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { runner.run(&device(), &request(), &sink, &cancel).await })
            };
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();

            let exit = tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("cancelled workload must stop within the grace period")
                .unwrap()
                .unwrap();
            assert_eq!(exit, WorkloadExit::Cancelled);
            assert!(started.elapsed() < Duration::from_secs(5));
            assert_eq!(sink.contents().unwrap(), "started\n");
        }

        #[tokio::test]
        async fn test_run_missing_program_is_a_launch_error() {
            let mut config = StressConfig::default();
            config.tools.fio = "/nonexistent/fio".to_string();
            let runner = WorkloadRunner::new(&config);
            let sink = LogSink::memory();

            let err = runner
                .run(&device(), &request(), &sink, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, LaunchError::Spawn { ref program, .. } if program == "/nonexistent/fio"));
            assert!(sink.is_empty());
        }
    }

    #[test]
    fn test_exit_success() {
        assert!(WorkloadExit::Exited { code: Some(0) }.success());
        assert!(!WorkloadExit::Exited { code: Some(1) }.success());
        assert!(!WorkloadExit::Exited { code: None }.success());
        assert!(!WorkloadExit::Cancelled.success());
    }
}
