//! Background telemetry sampling.
//!
//! A sampler is an independent tokio task that reads a [`TelemetrySource`]
//! on a fixed interval and appends one `[TEMP]` line per reading to a
//! [`LogSink`]. Source failures are logged and skipped. [`SamplerHandle::stop`]
//! joins the task, so once it returns nothing else reaches the sink.

pub mod sources;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::devices::Device;
use crate::health::{HealthError, HealthProbe};
use crate::runlog::{LogError, LogSink};

pub use sources::{DeviceTemperature, HostTemperature};

/// Tag on every telemetry line in a run log.
pub const TEMP_TAG: &str = "[TEMP]";
/// Tag on lines recording a missed sample.
pub const TEMP_MISS_TAG: &str = "[TEMP-MISS]";

#[derive(Debug, Error)]
pub enum SampleError {
    #[error(transparent)]
    Health(#[from] HealthError),

    #[error("no temperature reading in health output")]
    NoTemperature,

    #[error("{0}")]
    Source(String),
}

/// Something that can be sampled for temperature-bearing text.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Short label written into each sample line.
    fn name(&self) -> &str;

    async fn read(&self) -> Result<String, SampleError>;
}

/// One timestamped reading.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub text: String,
}

impl TelemetrySample {
    pub fn now(source: &str, text: String) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.to_string(),
            text,
        }
    }

    /// `[TEMP] 2026-10-17T09:05:03Z nvme1n1 Temperature: 41 Celsius`
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {}",
            TEMP_TAG,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.source,
            self.text
        )
    }
}

/// Counters returned when a sampler stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub samples: u64,
    pub misses: u64,
}

/// Starts samplers at a fixed interval.
#[derive(Debug, Clone, Copy)]
pub struct TelemetrySampler {
    interval: Duration,
}

impl TelemetrySampler {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Sample `device` temperature through `probe` into `sink`.
    pub fn start_device(&self, device: &Device, probe: Arc<dyn HealthProbe>, sink: LogSink) -> SamplerHandle {
        self.start(Arc::new(DeviceTemperature::new(device.clone(), probe)), sink)
    }

    /// Spawn the sampling task. The first sample is taken immediately.
    pub fn start(&self, source: Arc<dyn TelemetrySource>, sink: LogSink) -> SamplerHandle {
        let token = CancellationToken::new();
        let name = source.name().to_string();
        let task = tokio::spawn(sample_loop(source, sink, self.interval, token.clone()));
        debug!(source = %name, interval_ms = self.interval.as_millis() as u64, "telemetry sampler started");
        SamplerHandle {
            name,
            token,
            task: Some(task),
        }
    }
}

async fn sample_loop(
    source: Arc<dyn TelemetrySource>,
    sink: LogSink,
    interval: Duration,
    token: CancellationToken,
) -> SamplerStats {
    let mut stats = SamplerStats::default();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let reading = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            r = source.read() => r,
        };

        let line = match reading {
            Ok(text) => {
                stats.samples += 1;
                TelemetrySample::now(source.name(), text).to_line()
            }
            Err(e) => {
                stats.misses += 1;
                warn!(source = %source.name(), error = %e, "telemetry sample missed");
                format!(
                    "{} {} {} {}",
                    TEMP_MISS_TAG,
                    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                    source.name(),
                    e
                )
            }
        };

        match sink.append(&line) {
            Ok(()) => {}
            Err(LogError::Closed) => {
                warn!(source = %source.name(), "sink closed under running sampler");
                break;
            }
            Err(e) => warn!(source = %source.name(), error = %e, "failed to write telemetry sample"),
        }
    }

    stats
}

/// Owner of a running sampler.
///
/// Dropping the handle cancels the task without waiting for it; call
/// [`stop`](Self::stop) to cancel and join.
pub struct SamplerHandle {
    name: String,
    token: CancellationToken,
    task: Option<JoinHandle<SamplerStats>>,
}

impl SamplerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Cancel the sampler and wait for its task to exit.
    pub async fn stop(mut self) -> SamplerStats {
        self.token.cancel();
        let Some(task) = self.task.take() else {
            return SamplerStats::default();
        };
        match task.await {
            Ok(stats) => {
                debug!(source = %self.name, samples = stats.samples, misses = stats.misses, "telemetry sampler stopped");
                stats
            }
            Err(e) => {
                error!(source = %self.name, error = %e, "telemetry sampler task failed");
                SamplerStats::default()
            }
        }
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Counter {
        reads: AtomicU64,
        fail_every: u64,
    }

    #[async_trait]
    impl TelemetrySource for Counter {
        fn name(&self) -> &str {
            "nvme7n1"
        }

        async fn read(&self) -> Result<String, SampleError> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_every > 0 && n % self.fail_every == 0 {
                return Err(SampleError::NoTemperature);
            }
            Ok(format!("Temperature: {} Celsius", 40 + n))
        }
    }

    struct Stuck;

    #[async_trait]
    impl TelemetrySource for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn read(&self) -> Result<String, SampleError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    fn counter(fail_every: u64) -> Arc<Counter> {
        Arc::new(Counter {
            reads: AtomicU64::new(0),
            fail_every,
        })
    }

    #[test]
    fn test_sample_line_format() {
        let sample = TelemetrySample {
            timestamp: DateTime::parse_from_rfc3339("2026-10-17T09:05:03Z").unwrap().with_timezone(&Utc),
            source: "nvme1n1".to_string(),
            text: "Temperature: 41 Celsius".to_string(),
        };
        assert_eq!(sample.to_line(), "[TEMP] 2026-10-17T09:05:03Z nvme1n1 Temperature: 41 Celsius");
    }

    #[tokio::test]
    async fn test_sampler_appends_in_order() {
        let sink = LogSink::memory();
        let handle = TelemetrySampler::new(Duration::from_millis(10)).start(counter(0), sink.clone());
        tokio::time::sleep(Duration::from_millis(80)).await;
        let stats = handle.stop().await;

        assert!(stats.samples >= 2);
        let text = sink.contents().unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len() as u64, stats.samples);
        assert!(lines.iter().all(|l| l.starts_with(TEMP_TAG)));
        assert!(lines[0].ends_with("nvme7n1 Temperature: 41 Celsius"));
        assert!(lines[1].ends_with("nvme7n1 Temperature: 42 Celsius"));
    }

    #[tokio::test]
    async fn test_no_samples_after_stop() {
        let sink = LogSink::memory();
        let handle = TelemetrySampler::new(Duration::from_millis(5)).start(counter(0), sink.clone());
        tokio::time::sleep(Duration::from_millis(40)).await;
        handle.stop().await;

        let len = sink.len();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sink.len(), len);
    }

    #[tokio::test]
    async fn test_failures_are_recorded_and_sampling_continues() {
        let sink = LogSink::memory();
        let handle = TelemetrySampler::new(Duration::from_millis(5)).start(counter(2), sink.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        let stats = handle.stop().await;

        assert!(stats.misses >= 1);
        assert!(stats.samples >= stats.misses);
        let text = sink.contents().unwrap();
        assert!(text.lines().any(|l| l.starts_with(TEMP_MISS_TAG)));
    }

    #[tokio::test]
    async fn test_stop_interrupts_a_slow_read() {
        let sink = LogSink::memory();
        let handle = TelemetrySampler::new(Duration::from_secs(5)).start(Arc::new(Stuck), sink.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("stop must not wait for the read");
        assert_eq!(stats, SamplerStats::default());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_closed_sink_ends_sampler() {
        let sink = LogSink::memory();
        sink.close();
        let handle = TelemetrySampler::new(Duration::from_millis(5)).start(counter(0), sink.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(handle.is_finished());
        handle.stop().await;
    }
}
