//! In-memory storage backend
//!
//! Disks are sparse: only pages that were written hold memory, everything
//! else reads as zeros, so multi-gigabyte devices cost nothing until touched.
//! Faults can be injected per device (writes, table access, open) and per
//! tool operation.

use super::{BlockDevice, FsTools, Storage, StorageError};
use crate::command_runner::CommandError;
use crate::error::ScanError;
use crate::model::{partition_path, Device, PartitionTable};
use crate::types::{DiskLabel, FileSystem};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

const PAGE_SIZE: u64 = 64 * 1024;

/// Filesystem tool operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolOp {
    Mkfs,
    Fsck,
    Resize,
    MinSize,
}

/// Makes writes to a device fail once `after_bytes` have been written.
///
/// The write crossing the limit lands partially. A one-shot fault clears
/// itself after firing; a persistent one fails every later write too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteFault {
    pub after_bytes: u64,
    pub persistent: bool,
}

#[derive(Debug)]
struct MemoryDisk {
    model: String,
    sector_size: u64,
    size: u64,
    table: Option<PartitionTable>,
    pages: HashMap<u64, Box<[u8]>>,
    open: bool,
    written: u64,
    write_fault: Option<WriteFault>,
    fail_table_read: bool,
    fail_table_write: bool,
    refuse_open: bool,
}

impl MemoryDisk {
    fn new(size: u64, sector_size: u64) -> Self {
        Self {
            model: "Memory Disk".to_string(),
            sector_size,
            size,
            table: None,
            pages: HashMap::new(),
            open: false,
            written: 0,
            write_fault: None,
            fail_table_read: false,
            fail_table_write: false,
            refuse_open: false,
        }
    }

    fn check_bounds(&self, path: &Path, offset: u64, len: usize) -> Result<(), StorageError> {
        let len = len as u64;
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(StorageError::OutOfBounds {
                device: path.display().to_string(),
                offset,
                len,
                size: self.size,
            });
        }
        Ok(())
    }

    fn read(&self, offset: u64, buf: &mut [u8]) {
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let (page, within) = (pos / PAGE_SIZE, (pos % PAGE_SIZE) as usize);
            let n = (PAGE_SIZE as usize - within).min(buf.len() - done);
            match self.pages.get(&page) {
                Some(data) => buf[done..done + n].copy_from_slice(&data[within..within + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let (page, within) = (pos / PAGE_SIZE, (pos % PAGE_SIZE) as usize);
            let n = (PAGE_SIZE as usize - within).min(data.len() - done);
            let slot = self
                .pages
                .entry(page)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            slot[within..within + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
    }
}

#[derive(Debug, Default)]
struct State {
    disks: BTreeMap<PathBuf, MemoryDisk>,
    tool_faults: HashMap<ToolOp, CommandError>,
    min_sizes: HashMap<PathBuf, u64>,
    tool_log: Vec<String>,
    deny_scan: bool,
}

impl State {
    /// Find the disk and partition number behind a partition node.
    fn locate(&self, node: &Path) -> Option<(PathBuf, u32)> {
        self.disks.iter().find_map(|(path, disk)| {
            disk.table.as_ref()?.partitions().iter().find_map(|p| {
                (partition_path(path, p.number) == node).then(|| (path.clone(), p.number))
            })
        })
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sparse in-memory disks with fault injection
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    state: Arc<Mutex<State>>,
    tools: MemoryTools,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(State::default()));
        Self {
            tools: MemoryTools {
                state: Arc::clone(&state),
            },
            state,
        }
    }

    /// Mirror scanned devices: same geometry and tables, contents all zeros.
    pub fn from_devices(devices: &[Device]) -> Self {
        let storage = Self::new();
        for d in devices {
            storage.add_disk(&d.path, d.size, d.sector_size);
            let mut state = lock(&storage.state);
            if let Some(disk) = state.disks.get_mut(&d.path) {
                disk.model = d.model.clone();
                disk.table = d.table.clone();
            }
        }
        storage
    }

    pub fn add_disk(&self, path: impl Into<PathBuf>, size: u64, sector_size: u64) {
        let path = path.into();
        debug!("Adding memory disk {} ({} bytes)", path.display(), size);
        lock(&self.state)
            .disks
            .insert(path, MemoryDisk::new(size, sector_size));
    }

    pub fn set_table(&self, path: &Path, table: Option<PartitionTable>) {
        if let Some(disk) = lock(&self.state).disks.get_mut(path) {
            disk.table = table;
        }
    }

    pub fn table(&self, path: &Path) -> Option<PartitionTable> {
        lock(&self.state).disks.get(path)?.table.clone()
    }

    /// Read raw contents, bypassing the exclusive-open rule.
    pub fn read(&self, path: &Path, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        if let Some(disk) = lock(&self.state).disks.get(path) {
            disk.read(offset, &mut buf);
        }
        buf
    }

    /// Write raw contents, bypassing faults and the exclusive-open rule.
    pub fn write(&self, path: &Path, offset: u64, data: &[u8]) {
        if let Some(disk) = lock(&self.state).disks.get_mut(path) {
            disk.write(offset, data);
        }
    }

    pub fn is_open(&self, path: &Path) -> bool {
        lock(&self.state).disks.get(path).is_some_and(|d| d.open)
    }

    pub fn inject_write_fault(&self, path: &Path, fault: WriteFault) {
        if let Some(disk) = lock(&self.state).disks.get_mut(path) {
            disk.written = 0;
            disk.write_fault = Some(fault);
        }
    }

    pub fn fail_table_read(&self, path: &Path) {
        if let Some(disk) = lock(&self.state).disks.get_mut(path) {
            disk.fail_table_read = true;
        }
    }

    pub fn fail_table_write(&self, path: &Path) {
        if let Some(disk) = lock(&self.state).disks.get_mut(path) {
            disk.fail_table_write = true;
        }
    }

    pub fn refuse_open(&self, path: &Path) {
        if let Some(disk) = lock(&self.state).disks.get_mut(path) {
            disk.refuse_open = true;
        }
    }

    /// Clear every device fault on `path`.
    pub fn clear_faults(&self, path: &Path) {
        if let Some(disk) = lock(&self.state).disks.get_mut(path) {
            disk.write_fault = None;
            disk.fail_table_read = false;
            disk.fail_table_write = false;
            disk.refuse_open = false;
        }
    }

    pub fn fail_tool(&self, op: ToolOp, error: CommandError) {
        lock(&self.state).tool_faults.insert(op, error);
    }

    pub fn set_min_size(&self, node: impl Into<PathBuf>, bytes: u64) {
        lock(&self.state).min_sizes.insert(node.into(), bytes);
    }

    pub fn deny_scan(&self) {
        lock(&self.state).deny_scan = true;
    }

    /// Every tool invocation so far, as `"<op> <fs> <node>"`.
    pub fn tool_log(&self) -> Vec<String> {
        lock(&self.state).tool_log.clone()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn open(&self, path: &Path) -> Result<Box<dyn BlockDevice>, StorageError> {
        let mut state = lock(&self.state);
        let disk = state
            .disks
            .get_mut(path)
            .ok_or_else(|| StorageError::NotFound(path.display().to_string()))?;
        if disk.open || disk.refuse_open {
            return Err(StorageError::Busy(path.display().to_string()));
        }
        disk.open = true;
        Ok(Box::new(MemoryDevice {
            path: path.to_path_buf(),
            sector_size: disk.sector_size,
            size: disk.size,
            state: Arc::clone(&self.state),
        }))
    }

    fn scan(&self) -> Result<Vec<Device>, ScanError> {
        let state = lock(&self.state);
        if state.deny_scan {
            return Err(ScanError::AccessDenied(
                "memory storage refuses enumeration".to_string(),
            ));
        }
        Ok(state
            .disks
            .iter()
            .map(|(path, disk)| Device {
                path: path.clone(),
                model: disk.model.clone(),
                sector_size: disk.sector_size,
                size: disk.size,
                label: disk
                    .table
                    .as_ref()
                    .map_or(DiskLabel::None, |t| t.kind.into()),
                table: disk.table.clone(),
            })
            .collect())
    }

    fn tools(&self) -> &dyn FsTools {
        &self.tools
    }
}

/// Exclusive handle on one memory disk
struct MemoryDevice {
    path: PathBuf,
    sector_size: u64,
    size: u64,
    state: Arc<Mutex<State>>,
}

impl MemoryDevice {
    fn with_disk<T>(
        &self,
        f: impl FnOnce(&mut MemoryDisk) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut state = lock(&self.state);
        let disk = state
            .disks
            .get_mut(&self.path)
            .ok_or_else(|| StorageError::NotFound(self.path.display().to_string()))?;
        f(disk)
    }

    fn io_error(&self, msg: &str) -> StorageError {
        StorageError::Io {
            device: self.path.display().to_string(),
            source: std::io::Error::other(msg.to_string()),
        }
    }
}

impl BlockDevice for MemoryDevice {
    fn path(&self) -> &Path {
        &self.path
    }

    fn logical_sector_size(&self) -> u64 {
        self.sector_size
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read_table(&mut self) -> Result<Option<PartitionTable>, StorageError> {
        let device = self.path.display().to_string();
        self.with_disk(|disk| {
            if disk.fail_table_read {
                return Err(StorageError::Table {
                    device,
                    details: "injected table read failure".to_string(),
                });
            }
            Ok(disk.table.clone())
        })
    }

    fn write_table(&mut self, table: &PartitionTable) -> Result<(), StorageError> {
        let device = self.path.display().to_string();
        self.with_disk(|disk| {
            if disk.fail_table_write {
                return Err(StorageError::Table {
                    device,
                    details: "injected table write failure".to_string(),
                });
            }
            disk.table = Some(table.clone());
            Ok(())
        })
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let path = self.path.clone();
        self.with_disk(|disk| {
            disk.check_bounds(&path, offset, buf.len())?;
            disk.read(offset, buf);
            Ok(())
        })
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path.clone();
        let fired = self.with_disk(|disk| {
            disk.check_bounds(&path, offset, data.len())?;
            let Some(fault) = disk.write_fault else {
                disk.write(offset, data);
                disk.written += data.len() as u64;
                return Ok(false);
            };
            let budget = fault.after_bytes.saturating_sub(disk.written) as usize;
            if data.len() <= budget {
                disk.write(offset, data);
                disk.written += data.len() as u64;
                return Ok(false);
            }
            disk.write(offset, &data[..budget]);
            disk.written += budget as u64;
            if !fault.persistent {
                disk.write_fault = None;
            }
            Ok(true)
        })?;
        if fired {
            return Err(self.io_error("injected write failure"));
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

impl Drop for MemoryDevice {
    fn drop(&mut self) {
        if let Some(disk) = lock(&self.state).disks.get_mut(&self.path) {
            disk.open = false;
        }
    }
}

/// Tool emulation: records invocations and updates the table's filesystem.
#[derive(Debug, Clone)]
pub struct MemoryTools {
    state: Arc<Mutex<State>>,
}

impl MemoryTools {
    fn begin(&self, op: ToolOp, fs: FileSystem, node: &Path) -> Result<(), CommandError> {
        let mut state = lock(&self.state);
        let name = match op {
            ToolOp::Mkfs => "mkfs",
            ToolOp::Fsck => "fsck",
            ToolOp::Resize => "resize",
            ToolOp::MinSize => "min_size",
        };
        state
            .tool_log
            .push(format!("{} {} {}", name, fs, node.display()));
        match state.tool_faults.get(&op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl FsTools for MemoryTools {
    fn mkfs(&self, node: &Path, fs: FileSystem, label: Option<&str>) -> Result<(), CommandError> {
        self.begin(ToolOp::Mkfs, fs, node)?;
        let mut state = lock(&self.state);
        let Some((disk_path, number)) = state.locate(node) else {
            return Err(CommandError::ExitCode {
                command: format!("mkfs {}", node.display()),
                code: 1,
                output: format!("{}: No such device", node.display()),
            });
        };
        let Some(disk) = state.disks.get_mut(&disk_path) else {
            return Ok(());
        };
        let sector_size = disk.sector_size;
        let start = disk.table.as_mut().and_then(|t| {
            t.set_filesystem(number, fs, label.map(str::to_string)).ok()?;
            t.find(number).map(|p| p.start)
        });
        if let (Some(start), true) = (start, fs.has_boot_sector()) {
            let mut sector = vec![0u8; 512];
            sector[0x1C..0x20].copy_from_slice(&((start / sector_size) as u32).to_le_bytes());
            sector[510] = 0x55;
            sector[511] = 0xAA;
            disk.write(start, &sector);
        }
        Ok(())
    }

    fn fsck(&self, node: &Path, fs: FileSystem) -> Result<(), CommandError> {
        if fs.fsck_command().is_none() {
            return Ok(());
        }
        self.begin(ToolOp::Fsck, fs, node)
    }

    fn resize(&self, node: &Path, fs: FileSystem, new_size: u64) -> Result<(), CommandError> {
        self.begin(ToolOp::Resize, fs, node)?;
        let state = lock(&self.state);
        match state.min_sizes.get(node) {
            Some(&min) if new_size < min => Err(CommandError::ExitCode {
                command: format!("resize {}", node.display()),
                code: 1,
                output: format!("New size smaller than minimum ({})", min),
            }),
            _ => Ok(()),
        }
    }

    fn min_size(&self, node: &Path, fs: FileSystem) -> Result<Option<u64>, CommandError> {
        self.begin(ToolOp::MinSize, fs, node)?;
        Ok(lock(&self.state).min_sizes.get(node).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{mb_to_bytes, NewPartition};
    use crate::types::{PartitionRole, TableKind};

    fn disk() -> (MemoryStorage, PathBuf) {
        let storage = MemoryStorage::new();
        let path = PathBuf::from("/dev/sdm");
        storage.add_disk(&path, mb_to_bytes(64), 512);
        (storage, path)
    }

    #[test]
    fn test_unwritten_space_reads_zero() {
        let (storage, path) = disk();
        let mut dev = storage.open(&path).unwrap();
        let mut buf = vec![0xFFu8; 4096];
        dev.read_at(mb_to_bytes(10), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_spanning_pages() {
        let (storage, path) = disk();
        let mut dev = storage.open(&path).unwrap();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        dev.write_at(PAGE_SIZE - 7, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        dev.read_at(PAGE_SIZE - 7, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_open_is_exclusive() {
        let (storage, path) = disk();
        let first = storage.open(&path).unwrap();
        assert!(matches!(storage.open(&path), Err(StorageError::Busy(_))));
        drop(first);
        assert!(storage.open(&path).is_ok());
    }

    #[test]
    fn test_out_of_bounds_access() {
        let (storage, path) = disk();
        let mut dev = storage.open(&path).unwrap();
        let err = dev.write_at(mb_to_bytes(64) - 10, &[0u8; 20]).unwrap_err();
        assert!(matches!(err, StorageError::OutOfBounds { .. }));
    }

    #[test]
    fn test_one_shot_write_fault_lands_partially() {
        let (storage, path) = disk();
        storage.inject_write_fault(
            &path,
            WriteFault {
                after_bytes: 100,
                persistent: false,
            },
        );
        let mut dev = storage.open(&path).unwrap();
        assert!(dev.write_at(0, &[7u8; 150]).is_err());
        drop(dev);
        let raw = storage.read(&path, 0, 150);
        assert!(raw[..100].iter().all(|&b| b == 7));
        assert!(raw[100..].iter().all(|&b| b == 0));

        let mut dev = storage.open(&path).unwrap();
        assert!(dev.write_at(0, &[1u8; 150]).is_ok());
    }

    #[test]
    fn test_persistent_write_fault() {
        let (storage, path) = disk();
        storage.inject_write_fault(
            &path,
            WriteFault {
                after_bytes: 0,
                persistent: true,
            },
        );
        let mut dev = storage.open(&path).unwrap();
        assert!(dev.write_at(0, &[1]).is_err());
        assert!(dev.write_at(512, &[1]).is_err());
    }

    #[test]
    fn test_mkfs_updates_table_and_boot_sector() {
        let (storage, path) = disk();
        let mut table = PartitionTable::new(TableKind::Gpt, mb_to_bytes(64), 512);
        table
            .add_partition(NewPartition {
                start: None,
                size: mb_to_bytes(8),
                fs: FileSystem::Unformatted,
                role: PartitionRole::Primary,
                label: None,
                mount_point: None,
                flags: Vec::new(),
            })
            .unwrap();
        storage.set_table(&path, Some(table));

        let node = partition_path(&path, 1);
        storage
            .tools()
            .mkfs(&node, FileSystem::Fat32, Some("EFI"))
            .unwrap();

        let table = storage.table(&path).unwrap();
        let p = table.find(1).unwrap();
        assert_eq!(p.fs, FileSystem::Fat32);
        assert_eq!(p.label.as_deref(), Some("EFI"));
        let sector = storage.read(&path, p.start, 512);
        assert_eq!(u32::from_le_bytes([sector[0x1C], sector[0x1D], sector[0x1E], sector[0x1F]]), 2048);
        assert_eq!(storage.tool_log(), vec!["mkfs fat32 /dev/sdm1"]);
    }

    #[test]
    fn test_tool_fault_is_returned() {
        let (storage, _) = disk();
        storage.fail_tool(
            ToolOp::Fsck,
            CommandError::ExitCode {
                command: "e2fsck".into(),
                code: 4,
                output: "corrupt".into(),
            },
        );
        let err = storage
            .tools()
            .fsck(Path::new("/dev/sdm1"), FileSystem::Ext4)
            .unwrap_err();
        assert!(matches!(err, CommandError::ExitCode { code: 4, .. }));
        // No checker, nothing to fail
        assert!(storage
            .tools()
            .fsck(Path::new("/dev/sdm2"), FileSystem::LinuxSwap)
            .is_ok());
    }
}
