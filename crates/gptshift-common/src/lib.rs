//! Common functionality of Gptshift: partition discovery, resize
//! planning, and the crash-tolerant resize executor.

pub mod copy;
pub mod disk;
pub mod error;
pub mod executor;
pub mod mkfs;
pub mod mount;
pub mod plan;
pub mod resolve;
pub mod run;
pub mod shrink;
pub mod sysblock;

/// The [`anyhow`] result type.
pub type Anyhow<T> = anyhow::Result<T>;
