//! The body of one run, from the pre-test health dump to the `[END]` line.

use std::sync::Arc;

use chrono::SecondsFormat;
use tracing::{error, info, warn};

use super::registry::DeviceLease;
use super::run::{RunState, TestRun};
use crate::health::HealthProbe;
use crate::runlog::{LogSink, END_TAG, HEALTH_AFTER, HEALTH_BEFORE, HEALTH_END, RUN_HEADER};
use crate::safety::Unmounted;
use crate::telemetry::TelemetrySampler;
use crate::workload::{WorkloadExit, WorkloadRunner};

/// Everything a run task owns.
pub(super) struct Pipeline {
    pub run: Arc<TestRun>,
    pub sink: LogSink,
    pub probe: Arc<dyn HealthProbe>,
    pub runner: WorkloadRunner,
    pub sampler: TelemetrySampler,
    pub lease: DeviceLease,
    pub unmounted: Unmounted,
}

/// Terminal bookkeeping that also happens if the pipeline unwinds.
struct Completion {
    run: Arc<TestRun>,
    sink: LogSink,
    lease: Option<DeviceLease>,
}

impl Completion {
    fn finish(mut self, terminal: RunState) {
        write_end(&self.sink, &self.run, &terminal);
        self.sink.close();
        if let Some(lease) = self.lease.take() {
            lease.finish(&self.run, terminal);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            error!(run = %self.run.id(), "run aborted before reaching a terminal state");
            let terminal = RunState::Failed {
                reason: "run aborted unexpectedly".to_string(),
            };
            write_end(&self.sink, &self.run, &terminal);
            self.sink.close();
            lease.finish(&self.run, terminal);
        }
    }
}

impl Pipeline {
    pub async fn execute(self) {
        let Pipeline {
            run,
            sink,
            probe,
            runner,
            sampler,
            lease,
            unmounted,
        } = self;
        let completion = Completion {
            run: run.clone(),
            sink: sink.clone(),
            lease: Some(lease),
        };

        write(&sink, &header(&run));
        if !unmounted.unmounted.is_empty() {
            write(&sink, &format!("[SAFETY] unmounted {}", unmounted.unmounted.join(", ")));
        }
        health_dump(&sink, probe.as_ref(), &run, HEALTH_BEFORE).await;

        if run.cancel_token().is_cancelled() {
            info!(run = %run.id(), "run cancelled before launch");
            completion.finish(RunState::Cancelled);
            return;
        }

        let process = match runner.launch(run.device(), run.request()) {
            Ok(process) => process,
            Err(e) => {
                error!(run = %run.id(), device = %run.device().name, error = %e, "workload launch failed");
                write(&sink, &format!("[ERROR] {}", e));
                completion.finish(RunState::Failed { reason: e.to_string() });
                return;
            }
        };

        run.advance(RunState::Running);
        let telemetry = sampler.start_device(run.device(), probe.clone(), sink.clone());

        let supervisor = {
            let sink = sink.clone();
            let cancel = run.cancel_token().clone();
            tokio::spawn(async move { process.supervise(&sink, &cancel).await })
        };
        let outcome = supervisor.await;

        let stats = telemetry.stop().await;
        info!(run = %run.id(), samples = stats.samples, misses = stats.misses, "telemetry stopped");

        health_dump(&sink, probe.as_ref(), &run, HEALTH_AFTER).await;

        let terminal = match outcome {
            Ok(WorkloadExit::Exited { code }) => RunState::Completed { exit_code: code },
            Ok(WorkloadExit::Cancelled) => RunState::Cancelled,
            Err(e) => {
                error!(run = %run.id(), error = %e, "workload supervisor failed");
                RunState::Failed {
                    reason: format!("workload supervisor failed: {}", e),
                }
            }
        };
        info!(run = %run.id(), device = %run.device().name, state = %terminal, "run finished");
        completion.finish(terminal);
    }
}

fn write(sink: &LogSink, text: &str) {
    if let Err(e) = sink.append(text) {
        warn!(error = %e, "failed to write run log");
    }
}

fn header(run: &TestRun) -> String {
    let request = run.request();
    format!(
        "{} device={} workload={} duration={}s label={} started={} ===",
        RUN_HEADER,
        run.device().path,
        request.workload,
        request.duration_secs,
        request
            .log_label
            .as_deref()
            .map_or_else(|| "-".to_string(), |l| format!("{:?}", l)),
        run.started_at().to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

async fn health_dump(sink: &LogSink, probe: &dyn HealthProbe, run: &TestRun, banner: &str) {
    write(sink, banner);
    match probe.report(run.device()).await {
        Ok(text) => write(sink, text.trim_end()),
        Err(e) => {
            warn!(device = %run.device().name, error = %e, "health query failed");
            write(sink, &format!("health query failed: {}", e));
        }
    }
    write(sink, HEALTH_END);
}

fn write_end(sink: &LogSink, run: &TestRun, terminal: &RunState) {
    let elapsed = run.elapsed().as_secs();
    let line = match terminal {
        RunState::Completed { exit_code } => format!(
            "{} state=completed exit_code={} elapsed={}s",
            END_TAG,
            exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
            elapsed
        ),
        RunState::Failed { reason } => format!(
            "{} state=failed elapsed={}s reason={:?}",
            END_TAG, elapsed, reason
        ),
        other => format!("{} state={} elapsed={}s", END_TAG, other.label(), elapsed),
    };
    write(sink, &line);
}
