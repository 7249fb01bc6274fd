//! Stateful wrapper over the GUID partition table of a disk or image.
//!
//! All mutations are staged in memory and hit the disk in a single
//! [`PartitionTable::commit`]. The resize executor opens the table anew for
//! every step, so each committed step is a durable checkpoint.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use gpt::partition::Partition;
use gpt::partition_types;
use gpt::GptConfig;
use uuid::Uuid;

use super::blkdev::BlockDevice;
use super::{is_block_dev, PartitionRecord};
use crate::error::{IoContext, ResizeError};

/// Number of blocks used by a GPT partition table copy (header plus
/// 128 entries of 128 bytes at 512-byte blocks).
const GPT_TABLE_BLOCKS: u64 = 33;

/// Suffix of the alternate label given to a newly created replacement
/// partition. It must be derivable, so that an interrupted run and its
/// successor converge on the same slot.
const ALTERNATE_LABEL_SUFFIX: &str = "_resized2";

/// The alternate label for a partition label.
pub fn alternate_label(original: &str) -> String {
    format!("{original}{ALTERNATE_LABEL_SUFFIX}")
}

/// The original label for an alternate label.
pub fn original_label(alternate: &str) -> &str {
    alternate
        .strip_suffix(ALTERNATE_LABEL_SUFFIX)
        .unwrap_or(alternate)
}

/// A GUID partition table read from a disk or image file.
pub struct PartitionTable {
    path: PathBuf,
    disk: gpt::GptDisk<'static>,
    partitions: BTreeMap<u32, Partition>,
    block_size: u64,
    disk_size: u64,
    dirty: bool,
}

impl PartitionTable {
    /// Read the partition table from a device or image.
    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self, ResizeError> {
        fn inner(path: &Path, writable: bool) -> Result<PartitionTable, ResizeError> {
            let file = OpenOptions::new()
                .read(true)
                .write(writable)
                .open(path)
                .map_err(|source| {
                    if source.kind() == std::io::ErrorKind::NotFound {
                        ResizeError::NoSuchDisk(path.to_path_buf())
                    } else {
                        ResizeError::io(format!("opening disk {path:?}"), source)
                    }
                })?;
            let disk_size = if is_block_dev(path) {
                BlockDevice::new(path)
                    .and_then(|dev| dev.size())
                    .io_context("querying block device size")?
            } else {
                file.metadata().io_context("querying image size")?.len()
            };
            let disk = GptConfig::new()
                .writable(writable)
                .open_from_device(Box::new(file))
                .map_err(ResizeError::NotGpt)?;
            let block_size = u64::from(*disk.logical_block_size());
            let partitions = disk.partitions().clone();
            Ok(PartitionTable {
                path: path.to_path_buf(),
                disk,
                partitions,
                block_size,
                disk_size,
                dirty: false,
            })
        }
        inner(path.as_ref(), writable)
    }

    /// The path the table was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The logical block size of the disk.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// The size of the disk in bytes.
    pub fn disk_size(&self) -> u64 {
        self.disk_size
    }

    /// The first byte usable for partitions.
    pub fn first_usable_byte(&self) -> u64 {
        (GPT_TABLE_BLOCKS + 1) * self.block_size
    }

    /// The last byte usable for partitions (inclusive).
    pub fn last_usable_byte(&self) -> u64 {
        (self.disk_size / self.block_size - GPT_TABLE_BLOCKS) * self.block_size - 1
    }

    /// Round a byte size up to the next block boundary.
    pub fn block_align(&self, size: u64) -> u64 {
        size.div_ceil(self.block_size) * self.block_size
    }

    /// Whether an on-disk slot size satisfies a requested byte size.
    ///
    /// Slots are block-granular, so a request is satisfied by its
    /// block-aligned rounding.
    pub fn size_matches(&self, slot_size: u64, requested: u64) -> bool {
        slot_size == self.block_align(requested)
    }

    /// Records for all used partition entries, ordered by start offset.
    pub fn records(&self) -> Vec<PartitionRecord> {
        let mut records: Vec<_> = self
            .partitions
            .iter()
            .filter(|(_, partition)| partition.is_used())
            .map(|(index, partition)| self.record(*index, partition))
            .collect();
        records.sort_by_key(|record| record.start);
        records
    }

    /// Record for the entry at the given slot, if it is used.
    pub fn record_at(&self, index: u32) -> Option<PartitionRecord> {
        self.partitions
            .get(&index)
            .filter(|partition| partition.is_used())
            .map(|partition| self.record(index, partition))
    }

    /// Find the used entry carrying the given label.
    pub fn find_by_label(&self, label: &str) -> Option<PartitionRecord> {
        self.partitions
            .iter()
            .find(|(_, partition)| partition.is_used() && partition.name == label)
            .map(|(index, partition)| self.record(*index, partition))
    }

    fn record(&self, index: u32, partition: &Partition) -> PartitionRecord {
        let start = partition.first_lba * self.block_size;
        let size = (partition.last_lba - partition.first_lba + 1) * self.block_size;
        PartitionRecord {
            sys_name: String::new(),
            label: partition.name.clone(),
            uuid: partition.part_guid.to_string().to_uppercase(),
            start,
            size,
            end: start + size - 1,
            index,
        }
    }

    /// Create a new entry at the given placement.
    ///
    /// The entry is named with the alternate label derived from
    /// `original_label`, carries a freshly generated partition GUID and a
    /// neutral Linux filesystem type, and inherits the attribute flags of
    /// the entry at `inherit_from`. Nothing treats it as bootable until the
    /// later identity swap.
    pub fn create_partition(
        &mut self,
        index: u32,
        start: u64,
        size: u64,
        original_label: &str,
        inherit_from: u32,
    ) -> Result<PartitionRecord, ResizeError> {
        if size == 0 {
            return Err(anyhow!("BUG: partition size must be positive").into());
        }
        let first_lba = start / self.block_size;
        if first_lba * self.block_size != start {
            return Err(anyhow!("BUG: partition start {start} is not block aligned").into());
        }
        let last_lba = first_lba + size.div_ceil(self.block_size) - 1;
        let end = (last_lba + 1) * self.block_size - 1;
        if start < self.first_usable_byte() || end > self.last_usable_byte() {
            return Err(anyhow!(
                "BUG: placement {start}..{end} is outside the usable disk area"
            )
            .into());
        }
        for record in self.records() {
            if start <= record.end && record.start <= end {
                return Err(anyhow!(
                    "BUG: placement {start}..{end} overlaps partition {} ({:?})",
                    record.index,
                    record.label
                )
                .into());
            }
        }
        if self.partitions.get(&index).is_some_and(Partition::is_used) {
            return Err(anyhow!("BUG: partition slot {index} is already in use").into());
        }
        let flags = self
            .partitions
            .get(&inherit_from)
            .map(|partition| partition.flags)
            .unwrap_or(0);
        self.partitions.insert(
            index,
            Partition {
                part_type_guid: partition_types::LINUX_FS,
                part_guid: Uuid::new_v4(),
                first_lba,
                last_lba,
                flags,
                name: alternate_label(original_label),
            },
        );
        self.dirty = true;
        Ok(self.record_at(index).expect("entry was just inserted"))
    }

    /// Shrink the entry at the given slot to the given byte size.
    ///
    /// The end is recomputed from the new size; start and slot are kept.
    pub fn shrink_entry(&mut self, index: u32, new_size: u64) -> Result<(), ResizeError> {
        let block_size = self.block_size;
        let partition = self
            .partitions
            .get_mut(&index)
            .filter(|partition| partition.is_used())
            .ok_or_else(|| anyhow!("BUG: no used partition in slot {index}"))?;
        let new_last = partition.first_lba + new_size.div_ceil(block_size) - 1;
        if new_last > partition.last_lba {
            return Err(anyhow!("BUG: refusing to grow slot {index} in place").into());
        }
        if new_last != partition.last_lba {
            partition.last_lba = new_last;
            self.dirty = true;
        }
        Ok(())
    }

    /// Swap label, type GUID, partition GUID, and attributes between two
    /// slots, leaving their byte ranges untouched.
    pub fn swap_identity(&mut self, a: u32, b: u32) -> Result<(), ResizeError> {
        let first = self
            .partitions
            .get(&a)
            .cloned()
            .ok_or_else(|| anyhow!("BUG: no partition in slot {a}"))?;
        let second = self
            .partitions
            .get(&b)
            .cloned()
            .ok_or_else(|| anyhow!("BUG: no partition in slot {b}"))?;
        let swap = |dst: &mut Partition, src: &Partition| {
            dst.name = src.name.clone();
            dst.part_type_guid = src.part_type_guid.clone();
            dst.part_guid = src.part_guid;
            dst.flags = src.flags;
        };
        swap(self.partitions.get_mut(&a).unwrap(), &second);
        swap(self.partitions.get_mut(&b).unwrap(), &first);
        self.dirty = true;
        Ok(())
    }

    /// Mark the entry at the given slot as unused.
    ///
    /// On disk this zeroes the entry's type GUID, which is how GPT denotes
    /// a free slot; the slot numbers of all other entries are unaffected.
    pub fn mark_unused(&mut self, index: u32) {
        if self.partitions.remove(&index).is_some() {
            self.dirty = true;
        }
    }

    /// Whether any staged mutation has not been committed yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the staged partition entries back to the disk and sync.
    pub fn commit(mut self) -> Result<(), ResizeError> {
        let partitions = std::mem::take(&mut self.partitions);
        self.disk
            .update_partitions(partitions)
            .io_context("staging partition table update")?;
        self.disk
            .write()
            .io_context("writing partition table")?;
        // Make the commit durable before the next step observes it.
        File::open(&self.path)
            .and_then(|file| file.sync_all())
            .io_context("syncing partition table")?;
        Ok(())
    }
}
