//! Tree-level filesystem copy and verification.
//!
//! Operates on two directory roots, typically ephemeral mounts of the
//! source and destination slots.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::stat::{utimensat, UtimensatFlags};
use nix::sys::time::TimeSpec;
use tracing::warn;

use crate::error::{IoContext, ResizeError};

/// Entries that are never copied or compared.
const EXCLUDED: &[&str] = &["lost+found", ".DS_Store", "System Volume Information"];

/// Copy the tree rooted at `src` into `dst`.
///
/// Directories are created, regular files are copied with their
/// modification and access times restored after the data write, symlinks
/// are passed through when the destination supports them, and all other
/// entry kinds are skipped.
pub fn copy_file_system(src: &Path, dst: &Path) -> Result<(), ResizeError> {
    copy_dir(src, dst)
}

fn copy_dir(src: &Path, dst: &Path) -> Result<(), ResizeError> {
    let entries = fs::read_dir(src).io_context("reading source directory")?;
    for entry in entries {
        let entry = entry.io_context("reading source directory")?;
        let name = entry.file_name();
        if is_excluded(&name) {
            continue;
        }
        let src_path = entry.path();
        let dst_path = dst.join(&name);
        let file_type = entry.file_type().io_context("reading entry type")?;
        if file_type.is_symlink() {
            let link = fs::read_link(&src_path).io_context("reading symlink")?;
            if let Err(error) = std::os::unix::fs::symlink(&link, &dst_path) {
                // The destination filesystem may not support symlinks.
                warn!("skipping symlink {src_path:?}: {error}");
            }
        } else if file_type.is_dir() {
            fs::create_dir(&dst_path).io_context("creating directory")?;
            copy_dir(&src_path, &dst_path)?;
        } else if file_type.is_file() {
            copy_file(&src_path, &dst_path)?;
        }
        // Sockets, FIFOs, and device nodes are skipped.
    }
    Ok(())
}

fn copy_file(src: &Path, dst: &Path) -> Result<(), ResizeError> {
    fs::copy(src, dst)
        .map_err(|source| ResizeError::io(format!("copying {src:?}"), source))?;
    // Restore timestamps after the data write completes, tar-style.
    let metadata = fs::metadata(src).io_context("reading source metadata")?;
    let accessed = metadata.accessed().unwrap_or(SystemTime::UNIX_EPOCH);
    let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    utimensat(
        None::<RawFd>,
        dst,
        &to_timespec(accessed),
        &to_timespec(modified),
        UtimensatFlags::FollowSymlink,
    )
    .map_err(|errno| {
        ResizeError::io(format!("restoring times on {dst:?}"), errno.into())
    })?;
    Ok(())
}

fn to_timespec(time: SystemTime) -> TimeSpec {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    TimeSpec::new(
        since_epoch.as_secs() as nix::libc::time_t,
        since_epoch.subsec_nanos() as nix::libc::c_long,
    )
}

/// The kind of a tree entry, for comparison purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Directory,
    File,
    Symlink,
}

/// Verify that two trees carry the same set of paths, the same kind per
/// path, and byte-equal content for regular files.
pub fn compare_file_system(left: &Path, right: &Path) -> Result<(), ResizeError> {
    let left_entries = collect_entries(left)?;
    let right_entries = collect_entries(right)?;
    for path in right_entries.keys() {
        if !left_entries.contains_key(path) {
            return Err(ResizeError::VerificationFailed {
                path: path.clone(),
                reason: "present only in the copy".to_owned(),
            });
        }
    }
    for (path, kind) in &left_entries {
        let Some(right_kind) = right_entries.get(path) else {
            return Err(ResizeError::VerificationFailed {
                path: path.clone(),
                reason: "missing from the copy".to_owned(),
            });
        };
        if kind != right_kind {
            return Err(ResizeError::VerificationFailed {
                path: path.clone(),
                reason: format!("kind changed from {kind:?} to {right_kind:?}"),
            });
        }
        if *kind == EntryKind::File && !files_equal(&left.join(path), &right.join(path))? {
            return Err(ResizeError::VerificationFailed {
                path: path.clone(),
                reason: "content differs".to_owned(),
            });
        }
    }
    Ok(())
}

fn collect_entries(root: &Path) -> Result<BTreeMap<PathBuf, EntryKind>, ResizeError> {
    let mut entries = BTreeMap::new();
    collect_into(root, Path::new(""), &mut entries)?;
    Ok(entries)
}

fn collect_into(
    root: &Path,
    relative: &Path,
    entries: &mut BTreeMap<PathBuf, EntryKind>,
) -> Result<(), ResizeError> {
    let dir = fs::read_dir(root.join(relative)).io_context("reading directory")?;
    for entry in dir {
        let entry = entry.io_context("reading directory")?;
        let name = entry.file_name();
        if is_excluded(&name) {
            continue;
        }
        let rel_path = relative.join(&name);
        let file_type = entry.file_type().io_context("reading entry type")?;
        if file_type.is_symlink() {
            entries.insert(rel_path, EntryKind::Symlink);
        } else if file_type.is_dir() {
            entries.insert(rel_path.clone(), EntryKind::Directory);
            collect_into(root, &rel_path, entries)?;
        } else if file_type.is_file() {
            entries.insert(rel_path, EntryKind::File);
        }
    }
    Ok(())
}

fn files_equal(left: &Path, right: &Path) -> Result<bool, ResizeError> {
    let mut left = BufReader::new(File::open(left).io_context("opening file for comparison")?);
    let mut right = BufReader::new(File::open(right).io_context("opening file for comparison")?);
    let mut left_buf = [0u8; 64 * 1024];
    let mut right_buf = [0u8; 64 * 1024];
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

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize, ResizeError> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader
            .read(&mut buf[filled..])
            .io_context("reading file for comparison")?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

fn is_excluded(name: &std::ffi::OsStr) -> bool {
    EXCLUDED.iter().any(|excluded| name == *excluded)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use super::*;

    fn build_source(root: &Path) {
        fs::create_dir_all(root.join("boot/grub")).unwrap();
        fs::write(root.join("boot/grub/grub.cfg"), "set timeout=0\n").unwrap();
        fs::write(root.join("kernel.img"), vec![0x42; 4096]).unwrap();
        symlink("kernel.img", root.join("kernel")).unwrap();
        fs::create_dir(root.join("lost+found")).unwrap();
        fs::write(root.join(".DS_Store"), "junk").unwrap();
    }

    #[test]
    fn test_copy_and_compare_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        build_source(&src);
        copy_file_system(&src, &dst).unwrap();
        assert!(dst.join("boot/grub/grub.cfg").is_file());
        assert!(dst.join("kernel").is_symlink());
        // The excluded set never makes it into the copy.
        assert!(!dst.join("lost+found").exists());
        assert!(!dst.join(".DS_Store").exists());
        compare_file_system(&src, &dst).unwrap();
    }

    #[test]
    fn test_copy_restores_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("file"), "content").unwrap();
        let old = TimeSpec::new(1_000_000, 0);
        utimensat(
            None::<RawFd>,
            &src.join("file"),
            &old,
            &old,
            UtimensatFlags::FollowSymlink,
        )
        .unwrap();
        copy_file_system(&src, &dst).unwrap();
        let copied = fs::metadata(dst.join("file")).unwrap().modified().unwrap();
        let expected = UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        assert_eq!(copied, expected);
    }

    #[test]
    fn test_compare_detects_content_change() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("file"), "content").unwrap();
        copy_file_system(&src, &dst).unwrap();
        fs::write(dst.join("file"), "tampered").unwrap();
        let error = compare_file_system(&src, &dst).unwrap_err();
        assert!(matches!(error, ResizeError::VerificationFailed { .. }));
    }

    #[test]
    fn test_compare_detects_extra_entry() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("file"), "content").unwrap();
        copy_file_system(&src, &dst).unwrap();
        fs::write(dst.join("extra"), "surprise").unwrap();
        let error = compare_file_system(&src, &dst).unwrap_err();
        assert!(matches!(error, ResizeError::VerificationFailed { .. }));
    }
}
