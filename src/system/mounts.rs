//! Live mount table (`/proc/mounts`) parsing and device/partition matching.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

/// One mounted filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountEntry {
    /// Mount source, e.g. `/dev/nvme0n1p1`.
    pub source: String,
    pub mount_point: PathBuf,
    pub fstype: String,
}

/// Snapshot of the mount table, in kernel order (oldest mount first).
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    /// Read and parse the mount table at `path`.
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read mount table {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    /// Parse `/proc/mounts` formatted text. Malformed lines are skipped.
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let source = fields.next()?;
                let mount_point = fields.next()?;
                let fstype = fields.next().unwrap_or_default();
                Some(MountEntry {
                    source: unescape(source),
                    mount_point: PathBuf::from(unescape(mount_point)),
                    fstype: fstype.to_string(),
                })
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// Entries whose source is `device` itself or one of its partitions.
    pub fn entries_for(&self, device: &str) -> Vec<&MountEntry> {
        self.entries
            .iter()
            .filter(|e| belongs_to(&e.source, device))
            .collect()
    }

    pub fn is_mounted(&self, device: &str) -> bool {
        self.entries.iter().any(|e| belongs_to(&e.source, device))
    }

    /// Disk name backing `/`, if the root filesystem lives on a `/dev` node.
    pub fn root_device(&self) -> Option<String> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.mount_point == Path::new("/"))
            .and_then(|e| e.source.strip_prefix("/dev/"))
            .map(parent_device)
    }
}

/// True if mount `source` is `/dev/{device}` or a partition of it.
///
/// `nvme0n1` owns `nvme0n1p3` but not `nvme0n10`; `sda` owns `sda1`.
pub fn belongs_to(source: &str, device: &str) -> bool {
    let Some(name) = source.strip_prefix("/dev/") else {
        return false;
    };
    let Some(suffix) = name.strip_prefix(device) else {
        return false;
    };
    if suffix.is_empty() {
        return true;
    }
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if let Some(num) = suffix.strip_prefix('p') {
        return all_digits(num) && device.ends_with(|c: char| c.is_ascii_digit());
    }
    all_digits(suffix) && device.ends_with(|c: char| c.is_ascii_alphabetic())
}

/// Map a partition name to its parent disk (`nvme0n1p2` -> `nvme0n1`,
/// `sda3` -> `sda`). Whole-disk names are returned unchanged.
pub fn parent_device(name: &str) -> String {
    let trimmed = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if trimmed.len() == name.len() {
        return name.to_string();
    }
    if let Some(base) = trimmed.strip_suffix('p') {
        if base.ends_with(|c: char| c.is_ascii_digit()) {
            return base.to_string();
        }
    }
    if trimmed.ends_with(|c: char| c.is_ascii_alphabetic())
        && ["sd", "vd", "hd", "xvd"].iter().any(|p| trimmed.starts_with(p))
    {
        return trimmed.to_string();
    }
    name.to_string()
}

/// Decode the octal escapes (`\040` etc.) the kernel uses in mount fields.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/nvme0n1p2 / ext4 rw,relatime 0 0
/dev/nvme0n1p1 /boot/efi vfat rw,relatime 0 0
/dev/nvme1n1p1 /mnt/scratch ext4 rw,relatime 0 0
/dev/nvme1n1p2 /mnt/my\\040data xfs rw,relatime 0 0
/dev/nvme10n1 /mnt/other ext4 rw,relatime 0 0
";

    #[test]
    fn test_parse_and_unescape() {
        let table = MountTable::parse(SAMPLE);
        assert_eq!(table.entries().len(), 6);
        let data = table.entries_for("nvme1n1");
        assert_eq!(data.len(), 2);
        assert_eq!(data[1].mount_point, PathBuf::from("/mnt/my data"));
        assert_eq!(data[1].fstype, "xfs");
    }

    #[test]
    fn test_partition_matching_is_exact() {
        assert!(belongs_to("/dev/nvme1n1", "nvme1n1"));
        assert!(belongs_to("/dev/nvme1n1p3", "nvme1n1"));
        assert!(!belongs_to("/dev/nvme1n10", "nvme1n1"));
        assert!(!belongs_to("/dev/nvme1n10p1", "nvme1n1"));
        assert!(belongs_to("/dev/sda1", "sda"));
        assert!(!belongs_to("/dev/sdab", "sda"));
        assert!(!belongs_to("tmpfs", "nvme1n1"));
    }

    #[test]
    fn test_is_mounted() {
        let table = MountTable::parse(SAMPLE);
        assert!(table.is_mounted("nvme0n1"));
        assert!(table.is_mounted("nvme10n1"));
        assert!(!table.is_mounted("nvme2n1"));
        assert!(!table.is_mounted("nvme1"));
    }

    #[test]
    fn test_root_device() {
        let table = MountTable::parse(SAMPLE);
        assert_eq!(table.root_device().as_deref(), Some("nvme0n1"));

        let overlay = MountTable::parse("overlay / overlay rw 0 0\n");
        assert_eq!(overlay.root_device(), None);
    }

    #[test]
    fn test_parent_device() {
        assert_eq!(parent_device("nvme0n1p2"), "nvme0n1");
        assert_eq!(parent_device("nvme0n1"), "nvme0n1");
        assert_eq!(parent_device("mmcblk0p2"), "mmcblk0");
        assert_eq!(parent_device("sda3"), "sda");
        assert_eq!(parent_device("sda"), "sda");
    }
}
