//! Filesystem detection by superblock magic.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Offset of the ext superblock within a partition.
const EXT_SUPERBLOCK_OFFSET: usize = 1024;
/// Magic of the ext2/3/4 family, little endian at superblock offset 56.
const EXT_MAGIC: u16 = 0xEF53;
/// Magic of squashfs at the start of a partition.
const SQUASHFS_MAGIC: &[u8; 4] = b"hsqs";

/// The filesystem kinds the resizer distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Ext4,
    Fat32,
    Squashfs,
    Unknown,
}

impl std::fmt::Display for FsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsKind::Ext4 => f.write_str("ext4"),
            FsKind::Fat32 => f.write_str("fat32"),
            FsKind::Squashfs => f.write_str("squashfs"),
            FsKind::Unknown => f.write_str("unknown"),
        }
    }
}

/// Result of probing a partition slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsProbe {
    pub kind: FsKind,
    /// Volume label, if the filesystem carries a non-empty one.
    pub label: Option<String>,
}

/// Probe the filesystem within the disk at the given byte offset.
pub fn probe_fs(disk: &Path, offset: u64) -> io::Result<FsProbe> {
    let mut file = File::open(disk)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = [0u8; 2048];
    let mut filled = 0;
    while filled < buf.len() {
        let read = file.read(&mut buf[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(sniff(&buf[..filled]))
}

fn sniff(buf: &[u8]) -> FsProbe {
    if buf.len() >= EXT_SUPERBLOCK_OFFSET + 136 {
        let sb = &buf[EXT_SUPERBLOCK_OFFSET..];
        let magic = u16::from_le_bytes([sb[56], sb[57]]);
        if magic == EXT_MAGIC {
            return FsProbe {
                kind: FsKind::Ext4,
                label: ascii_label(&sb[120..136]),
            };
        }
    }
    if buf.len() >= 512 && &buf[82..90] == b"FAT32   " && buf[510..512] == [0x55, 0xAA] {
        return FsProbe {
            kind: FsKind::Fat32,
            label: ascii_label(&buf[71..82]),
        };
    }
    if buf.len() >= 4 && &buf[..4] == SQUASHFS_MAGIC {
        return FsProbe {
            kind: FsKind::Squashfs,
            label: None,
        };
    }
    FsProbe {
        kind: FsKind::Unknown,
        label: None,
    }
}

/// Extract a trimmed label from a fixed-size, NUL- or space-padded field.
fn ascii_label(raw: &[u8]) -> Option<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let label = String::from_utf8_lossy(&raw[..end]);
    let label = label.trim_end();
    if label.is_empty() || label == "NO NAME" {
        None
    } else {
        Some(label.to_owned())
    }
}
