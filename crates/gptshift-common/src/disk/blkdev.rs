//! Functionality for working with Linux block devices.

use std::fs;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

/// Block device.
#[derive(Debug, Clone)]
pub struct BlockDevice {
    /// Path of the block device in `/dev`.
    path: PathBuf,
}

impl BlockDevice {
    /// Create a block device from the given device path.
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        fn inner(path: &Path) -> io::Result<BlockDevice> {
            let path = path.canonicalize()?;
            if !super::is_block_dev(&path) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{path:?} is not a block device"),
                ));
            }
            Ok(BlockDevice { path })
        }
        inner(path.as_ref())
    }

    /// Path of the block device in `/dev`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Query the size of the block device in bytes.
    pub fn size(&self) -> io::Result<u64> {
        use nix::{ioctl_read, libc::c_ulonglong};

        ioctl_read! {
            /// Get the size of the block device in bytes.
            ioctl_get_size, 0x12, 114, c_ulonglong
        }

        let file = fs::File::open(&self.path)?;
        let mut size = 0;
        unsafe {
            // SAFETY: The file points to a block device.
            ioctl_get_size(file.as_raw_fd(), &mut size)
        }?;
        Ok(size)
    }

    /// Path of the given partition of this device.
    ///
    /// Follows the kernel naming convention: a `p` is inserted when the
    /// device name itself ends in a digit (`mmcblk0p1` vs. `sda1`).
    pub fn partition_path(&self, partition: u32) -> PathBuf {
        let mut path = self.path.to_string_lossy().into_owned();
        if path.ends_with(|c: char| c.is_ascii_digit()) {
            path.push('p');
        }
        path.push_str(&partition.to_string());
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_path_naming() {
        let dev = BlockDevice {
            path: PathBuf::from("/dev/sda"),
        };
        assert_eq!(dev.partition_path(3), PathBuf::from("/dev/sda3"));
        let dev = BlockDevice {
            path: PathBuf::from("/dev/mmcblk0"),
        };
        assert_eq!(dev.partition_path(1), PathBuf::from("/dev/mmcblk0p1"));
    }
}
