//! Byte-range I/O on partition slots.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Size of the copy buffer; a good default for both spinning and solid
/// state media.
pub const COPY_BUF_SIZE: usize = 4 * 1024 * 1024;

/// Reader over a partition slot, clamped to the slot's byte range.
pub struct PartitionReader {
    file: File,
    remaining: u64,
}

impl PartitionReader {
    /// Open a reader over `len` bytes starting at `start`.
    pub fn new(mut file: File, start: u64, len: u64) -> io::Result<Self> {
        file.seek(SeekFrom::Start(start))?;
        Ok(Self {
            file,
            remaining: len,
        })
    }

    /// The number of remaining bytes.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl Read for PartitionReader {
    fn read(&mut self, mut buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining < buf.len() as u64 {
            if self.remaining == 0 {
                return Ok(0);
            }
            // Clamp the buffer to the number of bytes remaining in the slot.
            buf = &mut buf[..self.remaining as usize];
        }
        let size = self.file.read(buf)?;
        self.remaining -= size as u64;
        Ok(size)
    }
}

/// Writer into a partition slot, refusing to write past the slot's end.
pub struct PartitionWriter {
    file: File,
    remaining: u64,
}

impl PartitionWriter {
    /// Open a writer over `len` bytes starting at `start`.
    pub fn new(mut file: File, start: u64, len: u64) -> io::Result<Self> {
        file.seek(SeekFrom::Start(start))?;
        Ok(Self {
            file,
            remaining: len,
        })
    }

    /// Flush and sync the underlying file.
    pub fn sync(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }
}

impl Write for PartitionWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if (buf.len() as u64) > self.remaining {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write past the end of the partition slot",
            ));
        }
        let size = self.file.write(buf)?;
        self.remaining -= size as u64;
        Ok(size)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Copy `length` bytes starting at `src_offset` in `src` into `dst`
/// starting at `dst_offset`.
///
/// Stops early when the source is exhausted. Returns the number of bytes
/// copied; the destination is synced before returning.
pub fn copy_range(
    src: &Path,
    dst: &Path,
    src_offset: u64,
    dst_offset: u64,
    length: u64,
) -> io::Result<u64> {
    let mut src = File::open(src)?;
    let mut dst = OpenOptions::new().read(true).write(true).create(true).open(dst)?;
    src.seek(SeekFrom::Start(src_offset))?;
    dst.seek(SeekFrom::Start(dst_offset))?;
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut copied: u64 = 0;
    while copied < length {
        let to_read = buf.len().min((length - copied) as usize);
        let read = src.read(&mut buf[..to_read])?;
        if read == 0 {
            break;
        }
        dst.write_all(&buf[..read])?;
        copied += read as u64;
    }
    dst.sync_all()?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn test_copy_range() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("src");
        let dst_path = dir.path().join("dst");
        let mut src = File::create(&src_path).unwrap();
        src.write_all(&[0u8; 100]).unwrap();
        src.write_all(&[7u8; 50]).unwrap();
        src.write_all(&[0u8; 100]).unwrap();
        drop(src);
        let copied = copy_range(&src_path, &dst_path, 100, 10, 50).unwrap();
        assert_eq!(copied, 50);
        let data = std::fs::read(&dst_path).unwrap();
        assert_eq!(data.len(), 60);
        assert_eq!(&data[10..60], &[7u8; 50]);
    }

    #[test]
    fn test_reader_clamps_to_slot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        std::fs::write(&path, [1u8; 64]).unwrap();
        let file = File::open(&path).unwrap();
        let mut reader = PartitionReader::new(file, 16, 8).unwrap();
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        assert_eq!(data, vec![1u8; 8]);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_writer_refuses_overrun() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        std::fs::write(&path, [0u8; 64]).unwrap();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let mut writer = PartitionWriter::new(file, 0, 4).unwrap();
        assert!(writer.write(&[1u8; 8]).is_err());
        writer.write_all(&[1u8; 4]).unwrap();
    }
}
