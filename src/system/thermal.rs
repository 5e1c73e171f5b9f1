use anyhow::{Context, Result};
use std::path::Path;

/// Read a sysfs thermal zone (millidegrees) as degrees Celsius.
pub fn read_zone_celsius(zone: &Path) -> Result<f64> {
    let raw = std::fs::read_to_string(zone)
        .with_context(|| format!("Failed to read thermal zone {}", zone.display()))?;
    let milli: f64 = raw
        .trim()
        .parse()
        .with_context(|| format!("Invalid thermal zone value {:?}", raw.trim()))?;
    Ok(milli / 1000.0)
}
