//! Run records: the state machine of one test run and its status projection.

use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::request::TestRequest;
use crate::devices::Device;
use crate::workload::WorkloadKind;

/// Identifier of one run, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a run.
///
/// `Pending -> SafetyChecked -> Running -> {Completed | Cancelled | Failed}`.
/// A run may also fail or be cancelled before it reaches `Running`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Pending,
    SafetyChecked,
    Running,
    Completed { exit_code: Option<i32> },
    Cancelled,
    Failed { reason: String },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed { .. } | RunState::Cancelled | RunState::Failed { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::SafetyChecked => "safety_checked",
            RunState::Running => "running",
            RunState::Completed { .. } => "completed",
            RunState::Cancelled => "cancelled",
            RunState::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Completed { exit_code: Some(code) } => write!(f, "completed (exit {})", code),
            RunState::Completed { exit_code: None } => write!(f, "completed (killed by signal)"),
            RunState::Failed { reason } => write!(f, "failed: {}", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub id: RunId,
    pub device: String,
    pub workload: WorkloadKind,
    pub duration_secs: u64,
    #[serde(flatten)]
    pub state: RunState,
    pub running: bool,
    /// Fraction of the requested duration elapsed, in `[0, 1]`.
    pub progress: f64,
    pub elapsed_secs: u64,
    pub remaining_secs: u64,
    pub started_at: DateTime<Utc>,
    pub log_file: PathBuf,
}

/// Shared record of one run. The pipeline task drives the state; everyone
/// else observes it.
#[derive(Debug)]
pub struct TestRun {
    id: RunId,
    request: TestRequest,
    device: Device,
    log_file: PathBuf,
    started_at: DateTime<Utc>,
    started: Instant,
    ended: OnceLock<Duration>,
    cancel: CancellationToken,
    state: watch::Sender<RunState>,
}

impl TestRun {
    pub fn new(request: TestRequest, device: Device, log_file: PathBuf) -> Self {
        let (state, _) = watch::channel(RunState::Pending);
        Self {
            id: RunId::new(),
            request,
            device,
            log_file,
            started_at: Utc::now(),
            started: Instant::now(),
            ended: OnceLock::new(),
            cancel: CancellationToken::new(),
            state,
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn request(&self) -> &TestRequest {
        &self.request
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn log_file(&self) -> &PathBuf {
        &self.log_file
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> RunState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Move to a non-terminal state. Ignored once the run is terminal.
    pub fn advance(&self, next: RunState) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Enter a terminal state. Only the first call has any effect.
    pub fn finish(&self, terminal: RunState) -> bool {
        debug_assert!(terminal.is_terminal());
        let _ = self.ended.set(self.started.elapsed());
        self.state.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = terminal;
            true
        })
    }

    /// Wall-clock time since start, frozen once the run is terminal.
    pub fn elapsed(&self) -> Duration {
        self.ended.get().copied().unwrap_or_else(|| self.started.elapsed())
    }

    pub fn status(&self) -> RunStatus {
        let state = self.state();
        let duration = self.request.duration_secs;
        let elapsed = self.elapsed().as_secs();

        let progress = match state {
            RunState::Completed { .. } => 1.0,
            _ if duration == 0 => 0.0,
            _ => (elapsed as f64 / duration as f64).clamp(0.0, 1.0),
        };
        let remaining = if state.is_terminal() {
            0
        } else {
            duration.saturating_sub(elapsed)
        };

        RunStatus {
            id: self.id,
            device: self.device.name.clone(),
            workload: self.request.workload,
            duration_secs: duration,
            running: !state.is_terminal(),
            state,
            progress,
            elapsed_secs: elapsed,
            remaining_secs: remaining,
            started_at: self.started_at,
            log_file: self.log_file.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::MountState;

    fn run(duration: u64) -> TestRun {
        TestRun::new(
            TestRequest::new("nvme1n1", duration, WorkloadKind::StandardRandom),
            Device::new("nvme1n1", None, "Test", MountState::Unmounted),
            PathBuf::from("logs/nvme_stress_nvme1n1_20261017_090503.log"),
        )
    }

    #[test]
    fn test_fresh_status() {
        let run = run(60);
        run.advance(RunState::SafetyChecked);
        let status = run.status();
        assert!(status.running);
        assert_eq!(status.progress, 0.0);
        assert_eq!(status.elapsed_secs, 0);
        assert_eq!(status.remaining_secs, 60);
        assert_eq!(status.state, RunState::SafetyChecked);
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let run = run(60);
        run.advance(RunState::Running);
        assert!(run.finish(RunState::Cancelled));
        assert!(!run.finish(RunState::Completed { exit_code: Some(0) }));
        run.advance(RunState::Running);

        let status = run.status();
        assert_eq!(status.state, RunState::Cancelled);
        assert!(!status.running);
        assert_eq!(status.remaining_secs, 0);
        assert!(status.progress < 1.0);
    }

    #[test]
    fn test_completed_reports_full_progress() {
        let run = run(600);
        run.advance(RunState::Running);
        run.finish(RunState::Completed { exit_code: Some(0) });
        let status = run.status();
        assert_eq!(status.progress, 1.0);
        assert!(!status.running);
    }

    #[test]
    fn test_status_json_shape() {
        let run = run(60);
        run.finish(RunState::Failed { reason: "fio not found".to_string() });
        let json = serde_json::to_value(run.status()).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["reason"], "fio not found");
        assert_eq!(json["running"], false);
        assert_eq!(json["device"], "nvme1n1");
        assert_eq!(json["workload"], "standard");
    }

    #[test]
    fn test_run_id_parse() {
        let id = RunId::new();
        assert_eq!(RunId::parse(&id.to_string()), Some(id));
        assert_eq!(RunId::parse("not-a-uuid"), None);
    }

    #[tokio::test]
    async fn test_subscribers_see_terminal_state() {
        let run = std::sync::Arc::new(run(60));
        let mut rx = run.subscribe();
        let r = run.clone();
        tokio::spawn(async move {
            r.advance(RunState::Running);
            r.finish(RunState::Completed { exit_code: Some(0) });
        });
        let state = rx.wait_for(|s| s.is_terminal()).await.unwrap().clone();
        assert_eq!(state, RunState::Completed { exit_code: Some(0) });
    }
}
