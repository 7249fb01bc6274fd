//! Shrinking ext4 filesystems ahead of a partition shrink.
//!
//! The actual ext4 work is delegated to the system's `e2fsck` and
//! `resize2fs`. The [`Ext4Tools`] seam exists so tests can substitute a
//! fake for both.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::NamedTempFile;
use tracing::info;

use crate::disk::fskind::{probe_fs, FsKind};
use crate::disk::stream::copy_range;
use crate::disk::{is_block_dev, PartitionRecord};
use crate::error::{IoContext, ResizeError};

/// The ext4 filesystem checker.
const E2FSCK: &str = "e2fsck";
/// The ext4 resize tool.
const RESIZE2FS: &str = "resize2fs";

/// The external ext4 toolchain.
pub trait Ext4Tools {
    /// Run a filesystem check: read-only unless `fix_errors` is set.
    fn check(&self, dev: &Path, fix_errors: bool) -> Result<(), ResizeError>;

    /// Resize the filesystem to the given number of MiB.
    fn resize(&self, dev: &Path, size_mib: u64) -> Result<(), ResizeError>;
}

/// [`Ext4Tools`] backed by the system's `e2fsck` and `resize2fs`.
pub struct SystemExt4Tools;

impl Ext4Tools for SystemExt4Tools {
    fn check(&self, dev: &Path, fix_errors: bool) -> Result<(), ResizeError> {
        let mode = if fix_errors { "-y" } else { "-n" };
        // `e2fsck` reports corrected errors through its exit status; when
        // fixing is requested, statuses 1 and 2 still mean a usable
        // filesystem.
        let ok_codes: &[i32] = if fix_errors { &[0, 1, 2] } else { &[0] };
        run_tool(E2FSCK, &["-f", mode], dev, ok_codes)
    }

    fn resize(&self, dev: &Path, size_mib: u64) -> Result<(), ResizeError> {
        let size = format!("{size_mib}M");
        run_tool(RESIZE2FS, &[&size], dev, &[0])
    }
}

fn run_tool(tool: &str, args: &[&str], dev: &Path, ok_codes: &[i32]) -> Result<(), ResizeError> {
    let mut command = Command::new(tool);
    match tool {
        // `resize2fs` takes the device before the size argument.
        RESIZE2FS => command.arg(dev).args(args),
        _ => command.args(args).arg(dev),
    };
    let status = command
        .status()
        .map_err(|source| ResizeError::io(format!("spawning `{tool}`"), source))?;
    let code = status.code().unwrap_or(-1);
    if ok_codes.contains(&code) {
        Ok(())
    } else {
        Err(ResizeError::ExternalToolFailed {
            tool: tool.to_owned(),
            code,
        })
    }
}

/// Shrink the ext4 filesystem on the given partition to `new_size` bytes.
///
/// On a block device the tools run against the partition's device node.
/// On a disk image the filesystem bytes are extracted to a temporary file,
/// resized there, and written back in place.
pub fn shrink_filesystem(
    disk_path: &Path,
    record: &PartitionRecord,
    new_size: u64,
    fix_errors: bool,
    tools: &dyn Ext4Tools,
) -> Result<(), ResizeError> {
    let probe = probe_fs(disk_path, record.start).io_context("probing shrink partition")?;
    if probe.kind != FsKind::Ext4 {
        return Err(ResizeError::UnsupportedFilesystem(probe.kind.to_string()));
    }
    let new_size_mib = new_size / (1024 * 1024);
    info!(
        "shrinking filesystem on partition {} ({:?}) from {} to {} bytes ({new_size_mib} MiB)",
        record.index, record.label, record.size, new_size
    );
    if is_block_dev(disk_path) {
        if record.sys_name.is_empty() {
            return Err(ResizeError::io(
                "resolving shrink partition device",
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "partition has no kernel device name",
                ),
            ));
        }
        let part_dev = PathBuf::from("/dev").join(&record.sys_name);
        tools.check(&part_dev, fix_errors)?;
        tools.resize(&part_dev, new_size_mib)?;
        return Ok(());
    }
    let metadata = disk_path.metadata().io_context("inspecting disk path")?;
    if !metadata.is_file() {
        return Err(ResizeError::io(
            "inspecting disk path",
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "disk is neither a block device nor an image file",
            ),
        ));
    }
    // Extract the filesystem so the tools see it at offset zero, resize it
    // there, and splice the shrunk filesystem back into the image.
    let scratch = NamedTempFile::new().io_context("creating scratch file")?;
    copy_range(disk_path, scratch.path(), record.start, 0, record.size)
        .io_context("extracting filesystem from image")?;
    tools.check(scratch.path(), fix_errors)?;
    tools.resize(scratch.path(), new_size_mib)?;
    copy_range(scratch.path(), disk_path, 0, record.start, new_size)
        .io_context("writing filesystem back into image")?;
    Ok(())
}
