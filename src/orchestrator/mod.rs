//! Test orchestration.
//!
//! [`Orchestrator`] owns device discovery, the safety gate and the run
//! registry. `start_test` does the pre-flight work (validation, device
//! lookup, per-device reservation, unmount, log creation) synchronously and
//! hands the rest of the run to a spawned pipeline task. Status queries only
//! read shared run records and never block on a running test.

mod pipeline;
mod registry;
mod request;
mod run;

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Local;
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::StressConfig;
use crate::devices::{Device, DeviceDiscovery, MountState};
use crate::health::{HealthError, HealthProbe, HealthVerdict, SmartctlProbe};
use crate::report::{self, SummaryReport};
use crate::runlog::{self, LogError, LogInfo, LogRecord, LogSink};
use crate::safety::{MountError, SafetyGate};
use crate::telemetry::{HostTemperature, SamplerHandle, TelemetrySampler};
use crate::workload::WorkloadRunner;

use self::pipeline::Pipeline;
use self::registry::RunRegistry;

pub use self::registry::DeviceLease;
pub use self::request::{TestRequest, ValidationError, MAX_DURATION_SECS, MIN_DURATION_SECS};
pub use self::run::{RunId, RunState, RunStatus, TestRun};

/// Extra time a stop request allows beyond the workload grace period and the
/// post-test health query.
const STOP_SLACK: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("device {device} already has an active run")]
    Conflict { device: String },

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error("failed to create run log: {0}")]
    Log(#[from] LogError),
}

#[derive(Debug, Error)]
#[error("no run with id {0}")]
pub struct RunNotFound(pub String);

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error(transparent)]
    Health(#[from] HealthError),
}

/// A device listing entry with an optional health verdict.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceEntry {
    #[serde(flatten)]
    pub device: Device,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthVerdict>,
    pub busy: bool,
}

struct Inner {
    config: StressConfig,
    discovery: DeviceDiscovery,
    devices: RwLock<Vec<Device>>,
    safety: SafetyGate,
    probe: Arc<dyn HealthProbe>,
    runner: WorkloadRunner,
    sampler: TelemetrySampler,
    registry: RunRegistry,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: StressConfig) -> Self {
        let probe = Arc::new(SmartctlProbe::new(&config));
        Self::with_probe(config, probe)
    }

    /// Build with a custom health probe.
    pub fn with_probe(config: StressConfig, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            inner: Arc::new(Inner {
                discovery: DeviceDiscovery::new(&config),
                devices: RwLock::new(Vec::new()),
                safety: SafetyGate::new(&config),
                runner: WorkloadRunner::new(&config),
                sampler: TelemetrySampler::new(config.telemetry.device_interval()),
                registry: RunRegistry::new(),
                probe,
                config,
            }),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.inner.config.logging.dir
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    /// Rediscover eligible devices.
    pub async fn list_devices(&self) -> Vec<Device> {
        let devices = self.inner.discovery.list().await;
        *self.inner.devices.write().unwrap_or_else(|p| p.into_inner()) = devices.clone();
        devices
    }

    /// Device listing, optionally with a health verdict per device.
    pub async fn device_entries(&self, with_health: bool) -> Vec<DeviceEntry> {
        let devices = self.list_devices().await;
        let verdicts: Vec<Option<HealthVerdict>> = if with_health {
            join_all(devices.iter().map(|d| self.inner.probe.verdict(d)))
                .await
                .into_iter()
                .map(Some)
                .collect()
        } else {
            vec![None; devices.len()]
        };
        devices
            .into_iter()
            .zip(verdicts)
            .map(|(device, health)| DeviceEntry {
                busy: self.inner.registry.is_busy(&device.name),
                device,
                health,
            })
            .collect()
    }

    /// Full health dump for one device.
    pub async fn device_health(&self, name: &str) -> Result<String, QueryError> {
        let device = self
            .find_device(name)
            .await
            .ok_or_else(|| QueryError::UnknownDevice(name.to_string()))?;
        Ok(self.inner.probe.report(&device).await?)
    }

    fn cached_device(&self, name: &str) -> Option<Device> {
        self.inner
            .devices
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|d| d.name == name)
            .cloned()
    }

    async fn find_device(&self, name: &str) -> Option<Device> {
        let name = name.trim().strip_prefix("/dev/").unwrap_or(name.trim());
        if let Some(device) = self.cached_device(name) {
            return Some(device);
        }
        self.list_devices().await.into_iter().find(|d| d.name == name)
    }

    fn mark_unmounted(&self, name: &str) {
        let mut devices = self.inner.devices.write().unwrap_or_else(|p| p.into_inner());
        for device in devices.iter_mut().filter(|d| d.name == name) {
            device.mount_state = MountState::Unmounted;
        }
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Validate, reserve the device, pass the safety gate, create the log and
    /// launch the run in the background.
    pub async fn start_test(&self, request: TestRequest) -> Result<RunId, StartError> {
        request.validate()?;
        let name = request.device_name().to_string();

        let device = self
            .find_device(&name)
            .await
            .ok_or_else(|| StartError::UnknownDevice(name.clone()))?;

        let lease = self
            .inner
            .registry
            .reserve(&device.name)
            .ok_or_else(|| StartError::Conflict {
                device: device.name.clone(),
            })?;

        let unmounted = if request.auto_unmount {
            self.inner.safety.ensure_unmounted(&device).await?
        } else {
            self.inner.safety.check(&device)?
        };
        if !unmounted.unmounted.is_empty() {
            self.mark_unmounted(&device.name);
        }
        let mut device = device;
        device.mount_state = MountState::Unmounted;

        let sink = runlog::create_run_log(
            self.log_dir(),
            &device.name,
            request.log_label.as_deref(),
            Local::now(),
        )?;
        let log_file = sink.path().map(Path::to_path_buf).unwrap_or_default();

        let run = Arc::new(TestRun::new(request, device, log_file));
        run.advance(RunState::SafetyChecked);
        self.inner.registry.insert(run.clone());

        info!(
            run = %run.id(),
            device = %run.device().name,
            workload = %run.request().workload,
            duration_secs = run.request().duration_secs,
            log = %run.log_file().display(),
            "test started"
        );

        let pipeline = Pipeline {
            run: run.clone(),
            sink,
            probe: self.inner.probe.clone(),
            runner: self.inner.runner.clone(),
            sampler: self.inner.sampler,
            lease,
            unmounted,
        };
        tokio::spawn(pipeline.execute());

        Ok(run.id())
    }

    fn run(&self, id: RunId) -> Result<Arc<TestRun>, RunNotFound> {
        self.inner
            .registry
            .get(id)
            .ok_or_else(|| RunNotFound(id.to_string()))
    }

    /// Cancel a run and wait (bounded) for it to become terminal. Stopping a
    /// run that already finished is a no-op.
    pub async fn stop_test(&self, id: RunId) -> Result<RunStatus, RunNotFound> {
        let run = self.run(id)?;
        if run.state().is_terminal() {
            return Ok(run.status());
        }
        info!(run = %id, device = %run.device().name, "stop requested");
        run.cancel();

        let bound = self.inner.config.workload.stop_grace() + self.inner.config.telemetry.query_timeout() + STOP_SLACK;
        let mut rx = run.subscribe();
        if tokio::time::timeout(bound, rx.wait_for(|s| s.is_terminal())).await.is_err() {
            warn!(run = %id, timeout_secs = bound.as_secs(), "run did not stop in time");
        }
        Ok(run.status())
    }

    pub fn status(&self, id: RunId) -> Result<RunStatus, RunNotFound> {
        Ok(self.run(id)?.status())
    }

    /// Every run started by this process, oldest first.
    pub fn list_runs(&self) -> Vec<RunStatus> {
        self.inner.registry.all().iter().map(|r| r.status()).collect()
    }

    /// Wait until the run is terminal.
    pub async fn wait(&self, id: RunId) -> Result<RunStatus, RunNotFound> {
        let run = self.run(id)?;
        let mut rx = run.subscribe();
        // The sender lives in `run`, which outlives this borrow.
        let _ = rx.wait_for(|s| s.is_terminal()).await;
        Ok(run.status())
    }

    /// Cancel every active run and wait for all of them to finish.
    pub async fn shutdown(&self) {
        let active = self.inner.registry.active();
        if active.is_empty() {
            return;
        }
        info!(count = active.len(), "stopping active runs");
        join_all(active.iter().map(|r| self.stop_test(r.id()))).await;
    }

    // ------------------------------------------------------------------
    // Logs and reports
    // ------------------------------------------------------------------

    pub fn list_logs(&self) -> Result<Vec<LogInfo>, LogError> {
        runlog::list_logs(self.log_dir())
    }

    pub fn read_log(&self, name: &str) -> Result<LogRecord, LogError> {
        runlog::read_log(self.log_dir(), name)
    }

    pub fn report(&self) -> Result<SummaryReport, LogError> {
        report::summarize_dir(self.log_dir())
    }

    /// Start the host-wide sampler writing into the system telemetry log.
    pub fn start_system_sampler(&self) -> Result<SamplerHandle, LogError> {
        let dir = self.log_dir();
        std::fs::create_dir_all(dir)?;
        let path: PathBuf = dir.join(runlog::SYSTEM_TELEMETRY_LOG);
        let sink = LogSink::append_to(&path)?;
        let source = Arc::new(HostTemperature::new(self.inner.config.telemetry.thermal_zone.clone()));
        info!(log = %path.display(), "system telemetry sampler started");
        Ok(TelemetrySampler::new(self.inner.config.telemetry.system_interval()).start(source, sink))
    }
}
