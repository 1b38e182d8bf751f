//! Device/Partition model
//!
//! In-memory mirror of every scanned device's partition table. The model is
//! read once at scan time and afterwards only changed through
//! [`DeviceModel::apply`] with the [`TableChange`] a committed job reports, so
//! it never races a mutation still landing on disk.
//!
//! All positions are byte offsets. Ranges are half-open: `[start, end)`.

use crate::error::ScanError;
use crate::storage::Storage;
use crate::types::{DiskLabel, FileSystem, PartitionFlag, PartitionRole, TableKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// One "MB" as used by plans and job descriptions.
pub const MIB: u64 = 1024 * 1024;

/// Trailing sectors a GPT keeps for its backup header and entry array.
const GPT_BACKUP_SECTORS: u64 = 33;

/// Highest entry number handed out on a GPT.
const GPT_MAX_ENTRIES: u32 = 128;

/// Convert whole megabytes to bytes.
pub fn mb_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(MIB)
}

/// Round `value` up to the next multiple of `align`.
pub fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Round `value` down to a multiple of `align`.
pub fn align_down(value: u64, align: u64) -> u64 {
    value / align * align
}

/// Generate a partition device path from a disk path and partition number.
///
/// Handles both `/dev/sdX` → `/dev/sdX1` and `/dev/nvme0n1` → `/dev/nvme0n1p1` patterns.
pub fn partition_path(disk: &Path, number: u32) -> PathBuf {
    let disk_str = disk.display().to_string();

    // NVMe, mmcblk and loop devices use a 'p' separator
    if disk_str.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{}p{}", disk_str, number))
    } else {
        PathBuf::from(format!("{}{}", disk_str, number))
    }
}

/// Identifies one partition of one device across the plan, jobs and model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionRef {
    pub device: PathBuf,
    pub number: u32,
}

impl PartitionRef {
    pub fn new(device: impl Into<PathBuf>, number: u32) -> Self {
        Self {
            device: device.into(),
            number,
        }
    }

    /// Kernel device node of the partition.
    pub fn node(&self) -> PathBuf {
        partition_path(&self.device, self.number)
    }
}

impl fmt::Display for PartitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.node().display())
    }
}

/// Violations of partition table invariants
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("range {start}..{end} is not free")]
    NotFree { start: u64, end: u64 },

    #[error("range {start}..{end} lies outside the usable area {first}..{last}")]
    OutOfRange {
        start: u64,
        end: u64,
        first: u64,
        last: u64,
    },

    #[error("offset {offset} is not aligned to the {sector_size}-byte sector size")]
    Misaligned { offset: u64, sector_size: u64 },

    #[error("partition size must be greater than zero")]
    Empty,

    #[error("an MBR table holds at most 4 primary partitions")]
    TooManyPrimaries,

    #[error("an MBR table holds at most one extended partition")]
    ExtendedExists,

    #[error("logical partitions require an extended partition")]
    NoExtended,

    #[error("extended partition {0} still contains logical partitions")]
    ExtendedNotEmpty(u32),

    #[error("{role} partitions are not supported on {kind} tables")]
    RoleNotSupported { role: PartitionRole, kind: TableKind },

    #[error("no free partition number left in the table")]
    TableFull,

    #[error("no free space of {size} bytes available")]
    NoSpace { size: u64 },

    #[error("partition {0} does not exist")]
    NotFound(u32),

    #[error("partitions {0} and {1} overlap")]
    Overlap(u32, u32),

    #[error("device {0} is not part of the model")]
    UnknownDevice(String),

    #[error("device {0} has no partition table")]
    NoTable(String),
}

/// One allocated entry of a partition table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub number: u32,
    pub start: u64,
    pub end: u64,
    #[serde(default)]
    pub fs: FileSystem,
    #[serde(default)]
    pub role: PartitionRole,
    #[serde(default)]
    pub mount_point: Option<PathBuf>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub flags: Vec<PartitionFlag>,
    #[serde(default)]
    pub identity: EntryIdentity,
}

/// On-disk identity of a table entry, written back exactly as it was read.
///
/// A `type_id` of `None` means the entry type follows the filesystem; that is
/// the case for entries a job created or formatted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryIdentity {
    #[serde(default)]
    pub type_id: Option<String>,
    /// GPT partition GUID (PARTUUID)
    #[serde(default)]
    pub uuid: Option<String>,
    /// GPT attribute bits as `sfdisk` prints them, e.g. `RequiredPartition GUID:63`
    #[serde(default)]
    pub attrs: Option<String>,
    /// GPT partition name (PARTLABEL), unrelated to the filesystem label
    #[serde(default)]
    pub name: Option<String>,
}

impl Partition {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Size rounded down to whole megabytes, as shown to the operator.
    pub fn size_mb(&self) -> u64 {
        self.size() / MIB
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    pub fn has_flag(&self, flag: PartitionFlag) -> bool {
        self.flags.contains(&flag)
    }

    fn is_top_level(&self) -> bool {
        self.role != PartitionRole::Logical
    }
}

/// Unallocated range; the placeholder rows of a partition listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSpace {
    pub start: u64,
    pub end: u64,
    /// Only logical partitions may be created here
    pub inside_extended: bool,
}

impl FreeSpace {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// Request to allocate a new entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPartition {
    /// Explicit byte offset; `None` places the entry at the first fitting free range
    pub start: Option<u64>,
    pub size: u64,
    pub fs: FileSystem,
    pub role: PartitionRole,
    pub label: Option<String>,
    pub mount_point: Option<PathBuf>,
    pub flags: Vec<PartitionFlag>,
}

/// The partition table of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTable {
    pub kind: TableKind,
    /// Disk GUID or MBR signature; `None` lets the writer generate one
    #[serde(default)]
    pub id: Option<String>,
    pub sector_size: u64,
    pub first_usable: u64,
    /// Exclusive end of the allocatable area
    pub last_usable: u64,
    /// Sorted by start offset
    partitions: Vec<Partition>,
}

impl PartitionTable {
    /// Empty table laid out for a device of `device_size` bytes.
    pub fn new(kind: TableKind, device_size: u64, sector_size: u64) -> Self {
        let reserved_tail = match kind {
            TableKind::Gpt => GPT_BACKUP_SECTORS * sector_size,
            TableKind::Mbr => 0,
        };
        let first_usable = MIB.max(sector_size);
        let last_usable = align_down(device_size.saturating_sub(reserved_tail), sector_size)
            .max(first_usable);
        Self {
            kind,
            id: None,
            sector_size,
            first_usable,
            last_usable,
            partitions: Vec::new(),
        }
    }

    /// Rebuild a table from scanned entries, checking every invariant.
    pub fn from_entries(
        kind: TableKind,
        device_size: u64,
        sector_size: u64,
        entries: Vec<Partition>,
    ) -> Result<Self, TableError> {
        let mut table = Self::new(kind, device_size, sector_size);
        // Extended entries first so their logicals find them
        let (mut top, logical): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(Partition::is_top_level);
        top.sort_by_key(|p| p.start);
        for p in top.into_iter().chain(logical) {
            table.insert(p)?;
        }
        Ok(table)
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn find(&self, number: u32) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.number == number)
    }

    pub fn extended(&self) -> Option<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.role == PartitionRole::Extended)
    }

    /// Primary plus extended entries; the MBR quota counts both.
    pub fn primary_count(&self) -> usize {
        self.partitions.iter().filter(|p| p.is_top_level()).count()
    }

    /// Unallocated ranges, top level and inside the extended partition.
    pub fn free_space(&self) -> Vec<FreeSpace> {
        let mut free = gaps(
            self.first_usable,
            self.last_usable,
            self.partitions.iter().filter(|p| p.is_top_level()),
            self.sector_size,
            false,
        );
        if let Some(ext) = self.extended() {
            free.extend(gaps(
                ext.start + self.sector_size,
                ext.end,
                self.partitions
                    .iter()
                    .filter(|p| p.role == PartitionRole::Logical),
                self.sector_size,
                true,
            ));
        }
        free.sort_by_key(|f| f.start);
        free
    }

    /// Allocate a new entry. Returns the created partition.
    pub fn add_partition(&mut self, req: NewPartition) -> Result<Partition, TableError> {
        if req.size == 0 {
            return Err(TableError::Empty);
        }
        let size = align_up(req.size, self.sector_size);
        let start = match req.start {
            Some(start) => start,
            None => self.place(size, req.role)?,
        };
        let number = self.next_number(req.role)?;
        let partition = Partition {
            number,
            start,
            end: start.saturating_add(size),
            fs: req.fs,
            role: req.role,
            mount_point: req.mount_point,
            label: req.label,
            flags: req.flags,
            identity: EntryIdentity::default(),
        };
        self.insert(partition.clone())?;
        debug!(
            "Added partition {} [{}..{}) to {} table",
            partition.number, partition.start, partition.end, self.kind
        );
        Ok(partition)
    }

    /// Insert an entry whose number and geometry are already decided.
    pub fn insert(&mut self, partition: Partition) -> Result<(), TableError> {
        self.check_role(partition.role)?;
        if self.find(partition.number).is_some() {
            return Err(TableError::NotFree {
                start: partition.start,
                end: partition.end,
            });
        }
        if partition.is_top_level() && self.kind == TableKind::Mbr {
            if self.primary_count() >= 4 {
                return Err(TableError::TooManyPrimaries);
            }
            if partition.role == PartitionRole::Extended && self.extended().is_some() {
                return Err(TableError::ExtendedExists);
            }
        }
        self.check_geometry(&partition, partition.start, partition.end, None)?;
        let at = self
            .partitions
            .iter()
            .position(|p| p.start > partition.start)
            .unwrap_or(self.partitions.len());
        self.partitions.insert(at, partition);
        Ok(())
    }

    /// Remove an entry. Logical partitions behind it are renumbered, the way
    /// the on-disk EBR chain renumbers them.
    pub fn remove_partition(&mut self, number: u32) -> Result<Partition, TableError> {
        let index = self
            .partitions
            .iter()
            .position(|p| p.number == number)
            .ok_or(TableError::NotFound(number))?;
        let target = &self.partitions[index];
        if target.role == PartitionRole::Extended
            && self
                .partitions
                .iter()
                .any(|p| p.role == PartitionRole::Logical)
        {
            return Err(TableError::ExtendedNotEmpty(number));
        }
        let removed = self.partitions.remove(index);
        if removed.role == PartitionRole::Logical {
            for p in self
                .partitions
                .iter_mut()
                .filter(|p| p.role == PartitionRole::Logical && p.number > number)
            {
                p.number -= 1;
            }
        }
        Ok(removed)
    }

    /// Move or resize an entry in place.
    pub fn set_geometry(&mut self, number: u32, start: u64, end: u64) -> Result<(), TableError> {
        let current = self.find(number).ok_or(TableError::NotFound(number))?.clone();
        self.check_geometry(&current, start, end, Some(number))?;
        if current.role == PartitionRole::Extended {
            if let Some(stray) = self.partitions.iter().find(|p| {
                p.role == PartitionRole::Logical
                    && (p.start < start + self.sector_size || p.end > end)
            }) {
                return Err(TableError::Overlap(number, stray.number));
            }
        }
        if let Some(p) = self.partitions.iter_mut().find(|p| p.number == number) {
            p.start = start;
            p.end = end;
        }
        self.partitions.sort_by_key(|p| p.start);
        Ok(())
    }

    /// Record the filesystem now carried by an entry.
    pub fn set_filesystem(
        &mut self,
        number: u32,
        fs: FileSystem,
        label: Option<String>,
    ) -> Result<(), TableError> {
        let p = self
            .partitions
            .iter_mut()
            .find(|p| p.number == number)
            .ok_or(TableError::NotFound(number))?;
        p.fs = fs;
        // The entry type follows the new filesystem
        p.identity.type_id = None;
        if label.is_some() {
            p.label = label;
        }
        Ok(())
    }

    /// Check every invariant of the whole table.
    pub fn validate(&self) -> Result<(), TableError> {
        let mut rebuilt = Self {
            partitions: Vec::new(),
            ..self.clone()
        };
        let (top, logical): (Vec<_>, Vec<_>) = self
            .partitions
            .iter()
            .cloned()
            .partition(Partition::is_top_level);
        for p in top.into_iter().chain(logical) {
            rebuilt.insert(p)?;
        }
        Ok(())
    }

    fn check_role(&self, role: PartitionRole) -> Result<(), TableError> {
        if self.kind == TableKind::Gpt && role != PartitionRole::Primary {
            return Err(TableError::RoleNotSupported {
                role,
                kind: self.kind,
            });
        }
        Ok(())
    }

    fn check_geometry(
        &self,
        partition: &Partition,
        start: u64,
        end: u64,
        ignore: Option<u32>,
    ) -> Result<(), TableError> {
        if end <= start {
            return Err(TableError::Empty);
        }
        for offset in [start, end] {
            if offset % self.sector_size != 0 {
                return Err(TableError::Misaligned {
                    offset,
                    sector_size: self.sector_size,
                });
            }
        }

        let (first, last) = if partition.role == PartitionRole::Logical {
            let ext = self.extended().ok_or(TableError::NoExtended)?;
            // One sector in front of every logical holds its EBR
            (ext.start + self.sector_size, ext.end)
        } else {
            (self.first_usable, self.last_usable)
        };
        if start < first || end > last {
            return Err(TableError::OutOfRange {
                start,
                end,
                first,
                last,
            });
        }

        let same_level = |p: &&Partition| {
            Some(p.number) != ignore
                && (p.role == PartitionRole::Logical) == (partition.role == PartitionRole::Logical)
        };
        if let Some(clash) = self
            .partitions
            .iter()
            .filter(same_level)
            .find(|p| p.overlaps(start, end))
        {
            return match ignore {
                Some(number) => Err(TableError::Overlap(number, clash.number)),
                None => Err(TableError::NotFree { start, end }),
            };
        }
        Ok(())
    }

    fn place(&self, size: u64, role: PartitionRole) -> Result<u64, TableError> {
        let inside = role == PartitionRole::Logical;
        if inside && self.extended().is_none() {
            return Err(TableError::NoExtended);
        }
        self.free_space()
            .into_iter()
            .filter(|f| f.inside_extended == inside)
            .find_map(|f| {
                let start = align_up(f.start, MIB.max(self.sector_size));
                (start + size <= f.end).then_some(start)
            })
            .ok_or(TableError::NoSpace { size })
    }

    fn next_number(&self, role: PartitionRole) -> Result<u32, TableError> {
        let used = |n: u32| self.partitions.iter().any(|p| p.number == n);
        match (self.kind, role) {
            (TableKind::Gpt, _) => (1..=GPT_MAX_ENTRIES)
                .find(|&n| !used(n))
                .ok_or(TableError::TableFull),
            (TableKind::Mbr, PartitionRole::Logical) => Ok(self
                .partitions
                .iter()
                .filter(|p| p.role == PartitionRole::Logical)
                .map(|p| p.number + 1)
                .max()
                .unwrap_or(5)),
            (TableKind::Mbr, _) => {
                if self.primary_count() >= 4 {
                    return Err(TableError::TooManyPrimaries);
                }
                (1..=4).find(|&n| !used(n)).ok_or(TableError::TooManyPrimaries)
            }
        }
    }
}

fn gaps<'a>(
    first: u64,
    last: u64,
    taken: impl Iterator<Item = &'a Partition>,
    sector_size: u64,
    inside_extended: bool,
) -> Vec<FreeSpace> {
    let mut taken: Vec<(u64, u64)> = taken.map(|p| (p.start, p.end)).collect();
    taken.sort_unstable();
    let mut free = Vec::new();
    let mut cursor = first;
    for (start, end) in taken {
        if start > cursor && start - cursor >= sector_size {
            free.push(FreeSpace {
                start: cursor,
                end: start,
                inside_extended,
            });
        }
        cursor = cursor.max(end);
    }
    if last > cursor && last - cursor >= sector_size {
        free.push(FreeSpace {
            start: cursor,
            end: last,
            inside_extended,
        });
    }
    free
}

/// A physical or virtual block device and its table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub path: PathBuf,
    #[serde(default)]
    pub model: String,
    pub sector_size: u64,
    pub size: u64,
    #[serde(default)]
    pub label: DiskLabel,
    #[serde(default)]
    pub table: Option<PartitionTable>,
}

impl Device {
    pub fn size_mb(&self) -> u64 {
        self.size / MIB
    }
}

/// A committed mutation, reported by a job and applied to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum TableChange {
    TableCreated {
        device: PathBuf,
        table: PartitionTable,
    },
    PartitionAdded {
        device: PathBuf,
        partition: Partition,
    },
    PartitionRemoved {
        device: PathBuf,
        number: u32,
    },
    GeometryChanged {
        device: PathBuf,
        number: u32,
        start: u64,
        end: u64,
    },
    FileSystemChanged {
        device: PathBuf,
        number: u32,
        fs: FileSystem,
        label: Option<String>,
    },
}

impl TableChange {
    pub fn device(&self) -> &Path {
        match self {
            Self::TableCreated { device, .. }
            | Self::PartitionAdded { device, .. }
            | Self::PartitionRemoved { device, .. }
            | Self::GeometryChanged { device, .. }
            | Self::FileSystemChanged { device, .. } => device,
        }
    }
}

/// All devices known to one installation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceModel {
    devices: Vec<Device>,
}

impl DeviceModel {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    /// Enumerate every device the storage backend can see.
    pub fn scan(storage: &dyn Storage) -> Result<Self, ScanError> {
        let devices = storage.scan()?;
        info!("Scanned {} storage device(s)", devices.len());
        Ok(Self { devices })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, path: &Path) -> Option<&Device> {
        self.devices.iter().find(|d| d.path == path)
    }

    /// `None` means unpartitioned or unrecognised, which is a valid state.
    pub fn find_partition_table(&self, path: &Path) -> Option<&PartitionTable> {
        self.device(path).and_then(|d| d.table.as_ref())
    }

    pub fn free_space_ranges(&self, path: &Path) -> Vec<FreeSpace> {
        self.find_partition_table(path)
            .map(PartitionTable::free_space)
            .unwrap_or_default()
    }

    pub fn find_partition(&self, part: &PartitionRef) -> Option<&Partition> {
        self.find_partition_table(&part.device)
            .and_then(|t| t.find(part.number))
    }

    /// Update the in-memory table to reflect a committed mutation.
    pub fn apply(&mut self, change: &TableChange) -> Result<(), TableError> {
        let path = change.device();
        let device = self
            .devices
            .iter_mut()
            .find(|d| d.path == path)
            .ok_or_else(|| TableError::UnknownDevice(path.display().to_string()))?;

        if let TableChange::TableCreated { table, .. } = change {
            device.label = table.kind.into();
            device.table = Some(table.clone());
            return Ok(());
        }

        let table = device
            .table
            .as_mut()
            .ok_or_else(|| TableError::NoTable(path.display().to_string()))?;
        match change {
            TableChange::TableCreated { .. } => {}
            TableChange::PartitionAdded { partition, .. } => table.insert(partition.clone())?,
            TableChange::PartitionRemoved { number, .. } => {
                table.remove_partition(*number)?;
            }
            TableChange::GeometryChanged {
                number, start, end, ..
            } => table.set_geometry(*number, *start, *end)?,
            TableChange::FileSystemChanged {
                number, fs, label, ..
            } => table.set_filesystem(*number, *fs, label.clone())?,
        }
        Ok(())
    }
}
