//! Utilities for working with disks, partitions, and resize requests.

use std::os::unix::prelude::FileTypeExt;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

pub mod blkdev;
pub mod fskind;
pub mod gpt;
pub mod stream;

/// One partition discovered on a disk.
///
/// All offsets and sizes are in bytes with inclusive interval semantics,
/// i.e., `end = start + size - 1`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionRecord {
    /// Kernel-visible device name (e.g. `sda1`), empty for disk images.
    pub sys_name: String,
    /// GPT partition name.
    pub label: String,
    /// GPT partition GUID, empty when discovered via Sysfs only.
    pub uuid: String,
    /// First byte of the partition.
    pub start: u64,
    /// Size of the partition in bytes.
    pub size: u64,
    /// Last byte of the partition (inclusive).
    pub end: u64,
    /// 1-based GPT slot number.
    pub index: u32,
}

impl PartitionRecord {
    /// Create a record from a start offset and size, computing the end.
    pub fn placed(start: u64, size: u64, index: u32) -> Self {
        Self {
            start,
            size,
            end: start + size - 1,
            index,
            ..Self::default()
        }
    }
}

/// The key by which a partition is identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifyBy {
    /// Kernel device name, e.g. `sda1`.
    Name,
    /// GPT partition name.
    Label,
    /// GPT partition GUID.
    Uuid,
}

impl std::fmt::Display for IdentifyBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentifyBy::Name => f.write_str("name"),
            IdentifyBy::Label => f.write_str("label"),
            IdentifyBy::Uuid => f.write_str("uuid"),
        }
    }
}

/// A user-supplied reference to a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionIdentifier {
    pub by: IdentifyBy,
    pub value: String,
}

impl PartitionIdentifier {
    pub fn new(by: IdentifyBy, value: impl Into<String>) -> Self {
        Self {
            by,
            value: value.into(),
        }
    }
}

impl std::fmt::Display for PartitionIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.by, self.value)
    }
}

/// A request to bring a partition to a target size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionChange {
    pub identifier: PartitionIdentifier,
    /// Requested size in bytes, always positive.
    pub size: u64,
}

impl PartitionChange {
    pub fn new(by: IdentifyBy, value: impl Into<String>, size: u64) -> Self {
        Self {
            identifier: PartitionIdentifier::new(by, value),
            size,
        }
    }
}

/// One row of a resize plan.
///
/// The logical partition identified by `original` shall occupy `target`
/// after the run. A pure shrink keeps start and index; a move carries a
/// fresh index and an always-new start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResizeAction {
    pub original: PartitionRecord,
    pub target: PartitionRecord,
}

impl ResizeAction {
    /// Whether this action shrinks the partition in place.
    pub fn is_shrink(&self) -> bool {
        self.target.size < self.original.size
    }

    /// Whether this action relocates the partition to a new byte range.
    pub fn is_move(&self) -> bool {
        self.original.start != self.target.start
    }
}

/// Convert a size string to bytes.
///
/// Accepts an integer with an optional case-insensitive binary unit suffix
/// `B`, `K`, `M`, `G`, or `T`; without a suffix the value is taken as
/// bytes.
pub fn parse_size(size: &str) -> Result<u64, InvalidSize> {
    let size = size.trim();
    if size.is_empty() {
        return Err(InvalidSize {
            value: size.to_owned(),
        });
    }
    let (number, factor): (&str, u64) = match size.as_bytes()[size.len() - 1] {
        b'B' | b'b' => (&size[..size.len() - 1], 1),
        b'K' | b'k' => (&size[..size.len() - 1], 1 << 10),
        b'M' | b'm' => (&size[..size.len() - 1], 1 << 20),
        b'G' | b'g' => (&size[..size.len() - 1], 1 << 30),
        b'T' | b't' => (&size[..size.len() - 1], 1 << 40),
        _ => (size, 1),
    };
    let value: u64 = number.parse().map_err(|_| InvalidSize {
        value: size.to_owned(),
    })?;
    value.checked_mul(factor).ok_or_else(|| InvalidSize {
        value: size.to_owned(),
    })
}

/// Error indicating an invalid size string.
#[derive(Debug, Clone, Error)]
#[error("invalid size {value:?}")]
pub struct InvalidSize {
    value: String,
}

/// Check whether the path refers to a block device.
pub fn is_block_dev(dev: impl AsRef<Path>) -> bool {
    let dev = dev.as_ref();
    dev.metadata()
        .map(|metadata| metadata.file_type().is_block_device())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("512B").unwrap(), 512);
        assert_eq!(parse_size("2K").unwrap(), 2 * 1024);
        assert_eq!(parse_size("512M").unwrap(), 512 * (1 << 20));
        assert_eq!(parse_size("3g").unwrap(), 3 * (1 << 30));
        assert_eq!(parse_size("1T").unwrap(), 1 << 40);
        assert!(parse_size("").is_err());
        assert!(parse_size("G").is_err());
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("x12M").is_err());
    }

    #[test]
    fn test_placed_record_end() {
        let record = PartitionRecord::placed(1024, 2048, 1);
        assert_eq!(record.end, 1024 + 2048 - 1);
    }

    #[test]
    fn test_identifier_display() {
        let id = PartitionIdentifier::new(IdentifyBy::Label, "system-a");
        assert_eq!(id.to_string(), "label=system-a");
    }
}
