//! Storage backends
//!
//! Jobs never touch devices directly. They go through [`Storage`], which hands
//! out exclusive [`BlockDevice`] handles and the [`FsTools`] that drive
//! filesystem utilities. Two backends exist:
//!
//! - [`SystemStorage`]: real block devices, `sfdisk`, `mkfs.*`, `e2fsck`, ...
//! - [`MemoryStorage`]: sparse in-memory disks with fault injection, used by
//!   `--dry-run` and the test suite

mod memory;
mod system;

pub use memory::{MemoryStorage, ToolOp, WriteFault};
pub use system::SystemStorage;

use crate::command_runner::CommandError;
use crate::error::ScanError;
use crate::model::{Device, PartitionTable};
use crate::types::FileSystem;
use std::path::Path;
use thiserror::Error;

/// Failures of a block device handle
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("device {0} does not exist")]
    NotFound(String),

    #[error("device {0} is busy or already opened by another process")]
    Busy(String),

    #[error("access {offset}+{len} is beyond the end of {device} ({size} bytes)")]
    OutOfBounds {
        device: String,
        offset: u64,
        len: u64,
        size: u64,
    },

    #[error("partition table on {device} could not be processed: {details}")]
    Table { device: String, details: String },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("I/O error on {device}: {source}")]
    Io {
        device: String,
        #[source]
        source: std::io::Error,
    },
}

/// An exclusively opened block device.
///
/// Dropping the handle releases the device.
pub trait BlockDevice: Send {
    fn path(&self) -> &Path;

    fn logical_sector_size(&self) -> u64;

    /// Device size in bytes
    fn size(&self) -> u64;

    /// `Ok(None)` for an unpartitioned device
    fn read_table(&mut self) -> Result<Option<PartitionTable>, StorageError>;

    /// Replace the on-disk table with `table` and make the kernel see it
    fn write_table(&mut self, table: &PartitionTable) -> Result<(), StorageError>;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError>;

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError>;

    fn sync(&mut self) -> Result<(), StorageError>;
}

/// Filesystem utilities, run against a partition node.
///
/// Callers must have dropped any [`BlockDevice`] handle of the parent disk
/// before calling, since the tools claim the node themselves.
pub trait FsTools: Send + Sync {
    fn mkfs(&self, node: &Path, fs: FileSystem, label: Option<&str>) -> Result<(), CommandError>;

    /// Filesystems without a checker succeed without running anything
    fn fsck(&self, node: &Path, fs: FileSystem) -> Result<(), CommandError>;

    /// Grow or shrink the filesystem to `new_size` bytes
    fn resize(&self, node: &Path, fs: FileSystem, new_size: u64) -> Result<(), CommandError>;

    /// Smallest size the filesystem can be shrunk to, if the tool reports one
    fn min_size(&self, node: &Path, fs: FileSystem) -> Result<Option<u64>, CommandError>;
}

/// Entry point to a family of devices.
pub trait Storage: Send + Sync {
    /// Open a whole-disk device exclusively
    fn open(&self, path: &Path) -> Result<Box<dyn BlockDevice>, StorageError>;

    /// Enumerate every device and read its table
    fn scan(&self) -> Result<Vec<Device>, ScanError>;

    fn tools(&self) -> &dyn FsTools;
}
