//! Concrete telemetry sources: per-device SMART temperature and host thermal zone.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::{SampleError, TelemetrySource};
use crate::devices::Device;
use crate::health::{self, HealthProbe};
use crate::system::thermal;

/// Temperature lines from the device's health dump.
pub struct DeviceTemperature {
    device: Device,
    probe: Arc<dyn HealthProbe>,
}

impl DeviceTemperature {
    pub fn new(device: Device, probe: Arc<dyn HealthProbe>) -> Self {
        Self { device, probe }
    }
}

#[async_trait]
impl TelemetrySource for DeviceTemperature {
    fn name(&self) -> &str {
        &self.device.name
    }

    async fn read(&self) -> Result<String, SampleError> {
        let report = self.probe.report(&self.device).await?;
        let lines = health::temperature_lines(&report);
        if lines.is_empty() {
            return Err(SampleError::NoTemperature);
        }
        Ok(lines.join(" | "))
    }
}

/// Host temperature from a sysfs thermal zone.
pub struct HostTemperature {
    zone: PathBuf,
}

impl HostTemperature {
    pub fn new(zone: PathBuf) -> Self {
        Self { zone }
    }
}

#[async_trait]
impl TelemetrySource for HostTemperature {
    fn name(&self) -> &str {
        "host"
    }

    async fn read(&self) -> Result<String, SampleError> {
        let celsius = thermal::read_zone_celsius(&self.zone)
            .map_err(|e| SampleError::Source(format!("{:#}", e)))?;
        Ok(format!("CPU Temperature: {:.1} Celsius", celsius))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::MountState;
    use crate::health::{HealthError, HealthVerdict};

    struct CannedProbe(&'static str);

    #[async_trait]
    impl HealthProbe for CannedProbe {
        async fn report(&self, _device: &Device) -> Result<String, HealthError> {
            Ok(self.0.to_string())
        }

        async fn verdict(&self, _device: &Device) -> HealthVerdict {
            HealthVerdict::Unknown
        }
    }

    fn device() -> Device {
        Device::new("nvme1n1", None, "Test", MountState::Unmounted)
    }

    #[tokio::test]
    async fn test_device_temperature_joins_lines() {
        let source = DeviceTemperature::new(
            device(),
            Arc::new(CannedProbe("Temperature: 40 Celsius\nSpare: 100%\nTemperature Sensor 1: 44 Celsius\n")),
        );
        assert_eq!(source.name(), "nvme1n1");
        assert_eq!(
            source.read().await.unwrap(),
            "Temperature: 40 Celsius | Temperature Sensor 1: 44 Celsius"
        );
    }

    #[tokio::test]
    async fn test_device_temperature_without_reading() {
        let source = DeviceTemperature::new(device(), Arc::new(CannedProbe("Spare: 100%\n")));
        assert!(matches!(source.read().await, Err(SampleError::NoTemperature)));
    }

    #[tokio::test]
    async fn test_host_temperature() {
        let dir = tempfile::tempdir().unwrap();
        let zone = dir.path().join("temp");
        std::fs::write(&zone, "48300\n").unwrap();
        let source = HostTemperature::new(zone);
        assert_eq!(source.read().await.unwrap(), "CPU Temperature: 48.3 Celsius");

        let missing = HostTemperature::new(dir.path().join("missing"));
        assert!(matches!(missing.read().await, Err(SampleError::Source(_))));
    }
}
