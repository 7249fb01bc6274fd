//! Error types shared across the resize pipeline.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::disk::PartitionIdentifier;

/// Errors produced while probing, planning, or executing a resize.
#[derive(Debug, Error)]
pub enum ResizeError {
    /// The planner could not place a grow request.
    ///
    /// This is the only error the planner recovers from: when a shrink
    /// partition has been designated, the plan is recomputed with the
    /// shrink included.
    #[error("not enough free space to resize partition {label} to requested size {requested}")]
    InsufficientSpace { label: String, requested: u64 },
    /// The disk does not carry a GUID partition table.
    #[error("unsupported partition table, only GPT is supported")]
    NotGpt(#[source] io::Error),
    /// The selector matched neither a block device nor a readable image.
    #[error("no such disk {0:?}")]
    NoSuchDisk(PathBuf),
    /// A filesystem kind we cannot shrink or copy.
    #[error("unsupported filesystem type {0}")]
    UnsupportedFilesystem(String),
    /// An identifier did not match any partition on the chosen disk.
    #[error("could not find partition for identifier: {0}")]
    PartitionNotFound(PartitionIdentifier),
    /// No disk carries all requested partitions.
    #[error("no disks found matching specified partitions")]
    NoMatchingDisk,
    /// More than one disk carries all requested partitions.
    #[error("multiple disks found matching specified partitions ({0})")]
    AmbiguousDisk(usize),
    /// An external executable exited with a failure status.
    #[error("`{tool}` failed with exit code {code}")]
    ExternalToolFailed { tool: String, code: i32 },
    /// Raw copy byte counts do not line up.
    #[error("mismatched read/write sizes: read {expected} bytes, wrote {actual} bytes")]
    CopyMismatch { expected: u64, actual: u64 },
    /// Tree verification found a difference between source and copy.
    #[error("verification failed for {path:?}: {reason}")]
    VerificationFailed { path: PathBuf, reason: String },
    /// I/O error, annotated with the step it occurred in.
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    /// Failure in one of the tool-level helpers (mount, mkfs, losetup).
    #[error("{0}")]
    Other(anyhow::Error),
}

impl ResizeError {
    /// Annotate an I/O error with the step it occurred in.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        ResizeError::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<anyhow::Error> for ResizeError {
    fn from(error: anyhow::Error) -> Self {
        ResizeError::Other(error)
    }
}

/// Extension trait for attaching step context to I/O results.
pub trait IoContext<T> {
    fn io_context(self, context: &str) -> Result<T, ResizeError>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context(self, context: &str) -> Result<T, ResizeError> {
        self.map_err(|source| ResizeError::io(context, source))
    }
}
