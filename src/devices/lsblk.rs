//! `lsblk -J` output parsing.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

/// One block device as reported by `lsblk -J -b -d -o NAME,SIZE,MODEL,TYPE`.
#[derive(Debug, Clone, Deserialize)]
pub struct LsblkDevice {
    pub name: String,
    /// Older util-linux releases print numbers as strings.
    #[serde(default, deserialize_with = "number_or_string")]
    pub size: Option<u64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// Parse lsblk JSON into its device list.
pub fn parse(json_str: &str) -> serde_json::Result<Vec<LsblkDevice>> {
    let out: LsblkOutput = serde_json::from_str(json_str)?;
    Ok(out.blockdevices)
}

fn number_or_string<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}
