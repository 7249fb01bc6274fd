//! Formatting partition slots before a tree copy.

use xscript::{run, Run};

use crate::Anyhow;

/// Format a slot with FAT32, carrying over the source volume label.
pub fn mkfs_vfat(dev: impl AsRef<str>, label: Option<&str>) -> Anyhow<()> {
    let dev = dev.as_ref();
    match label {
        Some(label) => run!(["mkfs.vfat", "-n", label, dev])?,
        None => run!(["mkfs.vfat", dev])?,
    };
    Ok(())
}

/// Format a slot with ext4, carrying over the source volume label.
pub fn mkfs_ext4(dev: impl AsRef<str>, label: Option<&str>) -> Anyhow<()> {
    let dev = dev.as_ref();
    match label {
        Some(label) => run!(["mkfs.ext4", "-F", "-L", label, dev])?,
        None => run!(["mkfs.ext4", "-F", dev])?,
    };
    Ok(())
}
