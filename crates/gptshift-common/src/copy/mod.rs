//! Copying partition contents from an original slot to its replacement.
//!
//! The strategy depends on the source filesystem: squashfs, unknown
//! content, and (by default) ext4 are streamed byte for byte; FAT32 and
//! optionally ext4 are copied as filesystem trees and verified entry by
//! entry.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::mpsc;
use std::thread;

use tracing::{debug, info};
use xscript::{read_str, run, Run};

use crate::disk::blkdev::BlockDevice;
use crate::disk::fskind::{probe_fs, FsKind};
use crate::disk::stream::{PartitionReader, PartitionWriter, COPY_BUF_SIZE};
use crate::disk::{is_block_dev, PartitionRecord, ResizeAction};
use crate::error::{IoContext, ResizeError};
use crate::mkfs::{mkfs_ext4, mkfs_vfat};
use crate::mount::Mounted;

pub mod tree;

pub use tree::{compare_file_system, copy_file_system};

/// How ext4 partitions are copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ext4Copy {
    /// Stream the raw bytes of the slot.
    #[default]
    Raw,
    /// Recreate the filesystem and copy the tree.
    Tree,
}

/// Copy the contents of the action's original slot into its target slot,
/// skipping work whose result is already present on disk.
pub fn copy_action(
    disk_path: &Path,
    action: &ResizeAction,
    ext4_copy: Ext4Copy,
) -> Result<(), ResizeError> {
    let probe = probe_fs(disk_path, action.original.start)
        .io_context("probing source filesystem")?;
    debug!(
        "partition {} carries a {} filesystem",
        action.original.index, probe.kind
    );
    match probe.kind {
        FsKind::Squashfs | FsKind::Unknown => raw_copy_checked(disk_path, action, probe.kind),
        FsKind::Ext4 if ext4_copy == Ext4Copy::Raw => {
            raw_copy_checked(disk_path, action, probe.kind)
        }
        FsKind::Ext4 => tree_copy(disk_path, action, FsKind::Ext4, probe.label.as_deref()),
        FsKind::Fat32 => tree_copy(disk_path, action, FsKind::Fat32, probe.label.as_deref()),
    }
}

fn raw_copy_checked(
    disk_path: &Path,
    action: &ResizeAction,
    kind: FsKind,
) -> Result<(), ResizeError> {
    if raw_equal(disk_path, &action.original, &action.target)
        .io_context("comparing partition contents")?
    {
        info!(
            "partition {} -> {}: contents already present, skipping copy",
            action.original.index, action.target.index
        );
        return Ok(());
    }
    let written = raw_copy(disk_path, &action.original, &action.target)?;
    info!(
        "partition {} -> {}: {kind} filesystem copied byte for byte, {written} bytes",
        action.original.index, action.target.index
    );
    Ok(())
}

/// Stream the source slot into the destination slot.
///
/// A producer thread reads the source while the consumer writes the
/// destination, connected by a bounded channel of fixed-size buffers. Both
/// sides must succeed and report matching byte counts.
fn raw_copy(
    disk_path: &Path,
    src: &PartitionRecord,
    dst: &PartitionRecord,
) -> Result<u64, ResizeError> {
    let src_file = File::open(disk_path).io_context("opening disk for reading")?;
    let dst_file = OpenOptions::new()
        .write(true)
        .open(disk_path)
        .io_context("opening disk for writing")?;
    let mut reader = PartitionReader::new(src_file, src.start, src.size)
        .io_context("seeking to source partition")?;
    let mut writer = PartitionWriter::new(dst_file, dst.start, dst.size)
        .io_context("seeking to target partition")?;
    let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(4);
    let (read_result, write_result) = thread::scope(|scope| {
        let producer = scope.spawn(move || -> io::Result<u64> {
            let mut total = 0u64;
            loop {
                let mut buf = vec![0u8; COPY_BUF_SIZE];
                let read = read_full(&mut reader, &mut buf)?;
                if read == 0 {
                    break;
                }
                buf.truncate(read);
                total += read as u64;
                if sender.send(buf).is_err() {
                    // The consumer hung up; it reports its own error.
                    break;
                }
            }
            Ok(total)
        });
        let write_result: io::Result<u64> = (|| {
            let mut total = 0u64;
            for buf in receiver.iter() {
                writer.write_all(&buf)?;
                total += buf.len() as u64;
            }
            writer.sync()?;
            Ok(total)
        })();
        // Dropping the receiver cancels a producer blocked on a full
        // channel after a consumer-side failure.
        drop(receiver);
        let read_result = producer.join().expect("copy producer panicked");
        (read_result, write_result)
    });
    let written = write_result.io_context("writing partition contents")?;
    let read = read_result.io_context("reading partition contents")?;
    if read != written {
        return Err(ResizeError::CopyMismatch {
            expected: read,
            actual: written,
        });
    }
    Ok(written)
}

/// Whether the destination slot already starts with the source's bytes.
fn raw_equal(disk_path: &Path, src: &PartitionRecord, dst: &PartitionRecord) -> io::Result<bool> {
    if dst.size < src.size {
        return Ok(false);
    }
    let mut left = PartitionReader::new(File::open(disk_path)?, src.start, src.size)?;
    let mut right = PartitionReader::new(File::open(disk_path)?, dst.start, src.size)?;
    let mut left_buf = vec![0u8; COPY_BUF_SIZE];
    let mut right_buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let left_read = read_full(&mut left, &mut left_buf)?;
        let right_read = read_full(&mut right, &mut right_buf)?;
        if left_read != right_read || left_buf[..left_read] != right_buf[..right_read] {
            return Ok(false);
        }
        if left_read == 0 {
            return Ok(true);
        }
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

/// Copy a slot as a filesystem tree.
///
/// The destination slot is formatted with the source's filesystem kind and
/// volume label, both slots are mounted ephemerally, the tree is copied,
/// and the result is verified entry by entry. When the destination already
/// carries a verified copy, nothing is written.
fn tree_copy(
    disk_path: &Path,
    action: &ResizeAction,
    kind: FsKind,
    label: Option<&str>,
) -> Result<(), ResizeError> {
    let access = SlotAccess::open(disk_path)?;
    let src_dev = access.partition_device(action.original.index)?;
    let dst_dev = access.partition_device(action.target.index)?;

    let dst_probe =
        probe_fs(disk_path, action.target.start).io_context("probing target filesystem")?;
    if dst_probe.kind == kind && verified_copy_exists(&src_dev, &dst_dev)? {
        info!(
            "partition {} -> {}: verified tree copy already present, skipping",
            action.original.index, action.target.index
        );
        return Ok(());
    }

    match kind {
        FsKind::Fat32 => mkfs_vfat(&dst_dev, label)?,
        FsKind::Ext4 => mkfs_ext4(&dst_dev, label)?,
        _ => {
            return Err(ResizeError::UnsupportedFilesystem(kind.to_string()));
        }
    }
    let src_root = tempfile::tempdir().io_context("creating mount point")?;
    let dst_root = tempfile::tempdir().io_context("creating mount point")?;
    let _src_mount = Mounted::mount_ro(&src_dev, src_root.path().to_string_lossy())?;
    let _dst_mount = Mounted::mount(&dst_dev, dst_root.path().to_string_lossy())?;
    copy_file_system(src_root.path(), dst_root.path())?;
    compare_file_system(src_root.path(), dst_root.path())?;
    info!(
        "partition {} -> {}: {kind} filesystem copied file by file",
        action.original.index, action.target.index
    );
    Ok(())
}

fn verified_copy_exists(src_dev: &str, dst_dev: &str) -> Result<bool, ResizeError> {
    let src_root = tempfile::tempdir().io_context("creating mount point")?;
    let dst_root = tempfile::tempdir().io_context("creating mount point")?;
    let Ok(_src_mount) = Mounted::mount_ro(src_dev, src_root.path().to_string_lossy()) else {
        return Ok(false);
    };
    let Ok(_dst_mount) = Mounted::mount_ro(dst_dev, dst_root.path().to_string_lossy()) else {
        return Ok(false);
    };
    Ok(compare_file_system(src_root.path(), dst_root.path()).is_ok())
}

/// Device nodes for the partition slots of a disk or image.
///
/// A block device already exposes its slots under `/dev`. An image is
/// attached to a free loop device with partition scanning for the duration
/// of the copy and detached again on drop.
enum SlotAccess {
    Block(BlockDevice),
    Loop(String),
}

impl SlotAccess {
    fn open(disk_path: &Path) -> Result<Self, ResizeError> {
        if is_block_dev(disk_path) {
            return Ok(SlotAccess::Block(
                BlockDevice::new(disk_path).io_context("opening block device")?,
            ));
        }
        let loop_dev =
            read_str!(["losetup", "-f"]).map_err(|error| anyhow::anyhow!(error))?;
        run!(["losetup", "-P", &loop_dev, disk_path])
            .map_err(|error| anyhow::anyhow!(error))?;
        Ok(SlotAccess::Loop(loop_dev))
    }

    /// Device node of the given slot.
    ///
    /// The replacement slot was committed right before the copy; a missing
    /// node means the kernel has not picked up the new table and the copy
    /// must not proceed.
    fn partition_device(&self, index: u32) -> Result<String, ResizeError> {
        let dev = match self {
            SlotAccess::Block(dev) => dev.partition_path(index).to_string_lossy().into_owned(),
            // Loop partitions always carry the `p` separator.
            SlotAccess::Loop(dev) => format!("{dev}p{index}"),
        };
        if !Path::new(&dev).exists() {
            return Err(ResizeError::io(
                format!("locating partition device {dev}"),
                io::Error::new(io::ErrorKind::NotFound, "no device node for the slot"),
            ));
        }
        Ok(dev)
    }
}

impl Drop for SlotAccess {
    fn drop(&mut self) {
        // Detach the loop device and ignore any errors.
        if let SlotAccess::Loop(dev) = self {
            run!(["losetup", "-d", dev.as_str()]).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|pos| seed.wrapping_add((pos % 251) as u8))
            .collect()
    }

    #[test]
    fn test_raw_copy_streams_all_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        let mut data = vec![0u8; 2 * 1024 * 1024];
        let payload = pattern(512 * 1024, 3);
        data[4096..4096 + payload.len()].copy_from_slice(&payload);
        std::fs::write(&image, &data).unwrap();
        let src = PartitionRecord::placed(4096, payload.len() as u64, 1);
        let dst = PartitionRecord::placed(1024 * 1024, payload.len() as u64, 2);
        let written = raw_copy(&image, &src, &dst).unwrap();
        assert_eq!(written, payload.len() as u64);
        let result = std::fs::read(&image).unwrap();
        assert_eq!(&result[1024 * 1024..1024 * 1024 + payload.len()], &payload[..]);
    }

    #[test]
    fn test_raw_equal_detects_divergence() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        let mut data = vec![0u8; 1024 * 1024];
        data[0..4].copy_from_slice(b"aaaa");
        data[8192..8196].copy_from_slice(b"aaaa");
        std::fs::write(&image, &data).unwrap();
        let src = PartitionRecord::placed(0, 4096, 1);
        let dst = PartitionRecord::placed(8192, 4096, 2);
        assert!(raw_equal(&image, &src, &dst).unwrap());
        data[8192] = b'b';
        std::fs::write(&image, &data).unwrap();
        assert!(!raw_equal(&image, &src, &dst).unwrap());
    }

    #[test]
    fn test_raw_copy_is_idempotent_via_equality_check() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        let mut data = vec![0u8; 1024 * 1024];
        let payload = pattern(64 * 1024, 9);
        data[0..payload.len()].copy_from_slice(&payload);
        std::fs::write(&image, &data).unwrap();
        let src = PartitionRecord::placed(0, payload.len() as u64, 1);
        let dst = PartitionRecord::placed(512 * 1024, payload.len() as u64, 2);
        let action = ResizeAction {
            original: src.clone(),
            target: dst.clone(),
        };
        raw_copy_checked(&image, &action, FsKind::Unknown).unwrap();
        assert!(raw_equal(&image, &src, &dst).unwrap());
        // A second pass finds the contents in place and leaves them alone.
        raw_copy_checked(&image, &action, FsKind::Unknown).unwrap();
    }
}
