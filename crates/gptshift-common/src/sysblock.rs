//! Disk and partition discovery through the system block tree.
//!
//! Live block devices are enumerated from the Sysfs class-block directory;
//! a selector that is not present there is treated as a disk image and read
//! through its GUID partition table instead.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::disk::gpt::PartitionTable;
use crate::disk::PartitionRecord;
use crate::error::{IoContext, ResizeError};

/// Default root of the system block tree.
pub const SYS_DEFAULT_PATH: &str = "/sys";

/// Child entries whose presence disqualifies a class-block entry from
/// being a disk (partitions, loop devices, device-mapper targets, zram).
const NON_DISK_CHILDREN: &[&str] = &["partition", "loop", "dm", "comp_algorithm"];

/// A discovered disk and its partitions.
#[derive(Debug, Clone)]
pub struct ProbedDisk {
    /// The path used to open the disk (device node or image file).
    pub path: PathBuf,
    /// Partition records, ordered by start offset.
    pub partitions: Vec<PartitionRecord>,
}

/// Find disks and their partitions.
///
/// With an empty selector, all disks under the system block tree are
/// enumerated. A selector naming an entry of the tree restricts discovery
/// to that disk. A selector that is not in the tree is opened as a disk
/// image; in that case records carry no `sys_name` and identification by
/// kernel name is not possible.
pub fn find_disks(
    selector: Option<&Path>,
    sys_path: Option<&Path>,
) -> Result<BTreeMap<String, ProbedDisk>, ResizeError> {
    let sys_root = sys_path.unwrap_or(Path::new(SYS_DEFAULT_PATH));
    let class_block = sys_root.join("class").join("block");
    let mut candidates = Vec::new();
    match selector {
        Some(selector) => {
            let base = selector
                .file_name()
                .ok_or_else(|| ResizeError::NoSuchDisk(selector.to_path_buf()))?
                .to_string_lossy()
                .into_owned();
            if class_block.join(&base).is_dir() {
                candidates.push((base, selector.to_path_buf()));
            } else {
                // Not under Sysfs; read it as a disk image.
                return probe_image(selector, &base);
            }
        }
        None => {
            let entries = fs::read_dir(&class_block)
                .io_context("reading the system block directory")?;
            for entry in entries {
                let entry = entry.io_context("reading the system block directory")?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let dev_path = Path::new("/dev").join(&name);
                candidates.push((name, dev_path));
            }
            candidates.sort();
        }
    }
    let mut disks = BTreeMap::new();
    for (name, dev_path) in candidates {
        let disk_dir = class_block.join(&name);
        if !disk_dir.is_dir() {
            continue;
        }
        if !classify_as_disk(&name, &disk_dir)? {
            debug!("skipping {name}, not a disk");
            continue;
        }
        let block_size = read_sys_int(&disk_dir.join("queue").join("logical_block_size"))?;
        let mut partitions = Vec::new();
        let children = fs::read_dir(&disk_dir).io_context("reading the disk directory")?;
        for child in children {
            let child = child.io_context("reading the disk directory")?;
            let child_path = child.path();
            if !child_path.is_dir() || !child_path.join("partition").is_file() {
                continue;
            }
            partitions.push(read_partition(&child_path, block_size)?);
        }
        partitions.sort_by_key(|record| record.start);
        debug!("discovered disk {name} with {} partitions", partitions.len());
        disks.insert(
            name,
            ProbedDisk {
                path: dev_path,
                partitions,
            },
        );
    }
    Ok(disks)
}

/// Classify a class-block entry: it is a disk when none of the non-disk
/// children exist and its name does not belong to a ramdisk.
fn classify_as_disk(name: &str, disk_dir: &Path) -> Result<bool, ResizeError> {
    if name.starts_with("ram") {
        return Ok(false);
    }
    for child in NON_DISK_CHILDREN {
        if disk_dir.join(child).exists() {
            return Ok(false);
        }
    }
    Ok(true)
}

fn read_partition(partition_dir: &Path, block_size: u64) -> Result<PartitionRecord, ResizeError> {
    let index = read_sys_int(&partition_dir.join("partition"))? as u32;
    let size = read_sys_int(&partition_dir.join("size"))?;
    let start = read_sys_int(&partition_dir.join("start"))?;
    let uevent = fs::read_to_string(partition_dir.join("uevent"))
        .io_context("reading partition uevent")?;
    let uevent = parse_key_value_lines(&uevent);
    let label = uevent.get("PARTNAME").cloned().unwrap_or_default();
    let sys_name = partition_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let start = start * block_size;
    let size = size * block_size;
    Ok(PartitionRecord {
        sys_name,
        label,
        uuid: String::new(),
        start,
        size,
        end: start + size - 1,
        index,
    })
}

/// Read partition records from a disk image by way of its GPT.
fn probe_image(image: &Path, base: &str) -> Result<BTreeMap<String, ProbedDisk>, ResizeError> {
    if !image.is_file() {
        return Err(ResizeError::NoSuchDisk(image.to_path_buf()));
    }
    let table = PartitionTable::open(image, false)?;
    let mut disks = BTreeMap::new();
    disks.insert(
        base.to_owned(),
        ProbedDisk {
            path: image.to_path_buf(),
            partitions: table.records(),
        },
    );
    Ok(disks)
}

/// Read an ASCII integer from a Sysfs attribute, trimming a single
/// trailing newline or carriage return.
fn read_sys_int(path: &Path) -> Result<u64, ResizeError> {
    let data = fs::read_to_string(path)
        .map_err(|source| ResizeError::io(format!("reading {path:?}"), source))?;
    let mut value = data.as_str();
    if value.ends_with('\n') || value.ends_with('\r') {
        value = &value[..value.len() - 1];
    }
    value.parse().map_err(|_| {
        ResizeError::io(
            format!("parsing {path:?}"),
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid integer {value:?}"),
            ),
        )
    })
}

/// Parse `KEY=VALUE` lines into a map. Lines without `=` are ignored; a
/// single trailing carriage return per line is trimmed.
pub fn parse_key_value_lines(data: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in data.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        map.insert(key.to_owned(), value.to_owned());
    }
    map
}
