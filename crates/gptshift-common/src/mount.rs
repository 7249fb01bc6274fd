//! Ephemeral mounts used while copying filesystem trees.

use camino::{Utf8Path, Utf8PathBuf};
use xscript::{run, Run};

use crate::Anyhow;

/// The `mount` executable.
const MOUNT: &str = "mount";
/// The `umount` executable.
const UMOUNT: &str = "umount";

/// A mounted filesystem, unmounted on drop.
pub struct Mounted {
    path: Utf8PathBuf,
}

impl Mounted {
    pub fn mount(dev: impl AsRef<str>, dst: impl AsRef<str>) -> Anyhow<Self> {
        let dev = dev.as_ref();
        let dst = dst.as_ref();
        run!([MOUNT, dev, dst])?;
        Ok(Mounted { path: dst.into() })
    }

    /// Mount read-only; used for copy sources.
    pub fn mount_ro(dev: impl AsRef<str>, dst: impl AsRef<str>) -> Anyhow<Self> {
        let dev = dev.as_ref();
        let dst = dst.as_ref();
        run!([MOUNT, "-o", "ro", dev, dst])?;
        Ok(Mounted { path: dst.into() })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for Mounted {
    fn drop(&mut self) {
        run!([UMOUNT, &self.path]).ok();
    }
}
