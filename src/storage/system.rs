//! Real block devices
//!
//! Devices are opened with `O_EXCL`, so the kernel refuses the open while any
//! partition of the disk is mounted or claimed. Tables are read with
//! `sfdisk --json` and written by feeding `sfdisk` a script; filesystem
//! utilities run through `command_runner` with the configured timeouts.

use super::{BlockDevice, FsTools, Storage, StorageError};
use crate::command_runner::{run_command, CommandError, ToolCommand};
use crate::config::ToolTimeouts;
use crate::error::ScanError;
use crate::model::{partition_path, Device, EntryIdentity, Partition, PartitionTable};
use crate::types::{DiskLabel, FileSystem, PartitionFlag, PartitionRole, TableKind};
use nix::libc;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const GPT_ESP: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
const GPT_BIOS_BOOT: &str = "21686148-6449-6E6F-744E-656564454649";
const MBR_EXTENDED: [&str; 3] = ["5", "f", "85"];
const MBR_ESP: &str = "ef";

/// Devices and tools of the running system
#[derive(Debug, Clone, Default)]
pub struct SystemStorage {
    tools: SystemTools,
}

impl SystemStorage {
    pub fn new(timeouts: ToolTimeouts) -> Self {
        Self {
            tools: SystemTools { timeouts },
        }
    }

    fn timeouts(&self) -> &ToolTimeouts {
        &self.tools.timeouts
    }
}

impl Storage for SystemStorage {
    fn open(&self, path: &Path) -> Result<Box<dyn BlockDevice>, StorageError> {
        let device = path.display().to_string();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_EXCL)
            .open(path)
            .map_err(|e| match e.raw_os_error() {
                Some(libc::EBUSY) => StorageError::Busy(device.clone()),
                Some(libc::ENOENT) => StorageError::NotFound(device.clone()),
                _ => StorageError::Io {
                    device: device.clone(),
                    source: e,
                },
            })?;
        let size = file.seek(SeekFrom::End(0)).map_err(|e| StorageError::Io {
            device: device.clone(),
            source: e,
        })?;
        let sector_size = logical_sector_size(path);
        info!(
            "Opened {} exclusively ({} bytes, {}-byte sectors)",
            device, size, sector_size
        );
        Ok(Box::new(SystemDevice {
            path: path.to_path_buf(),
            file,
            size,
            sector_size,
            timeouts: *self.timeouts(),
        }))
    }

    fn scan(&self) -> Result<Vec<Device>, ScanError> {
        let listing = run_command(
            &ToolCommand::new("lsblk", self.timeouts().query()).args([
                "--json",
                "--bytes",
                "--output",
                "PATH,TYPE,SIZE,MODEL,LOG-SEC,RO,FSTYPE,LABEL,MOUNTPOINT",
            ]),
        )?;
        let listing: LsblkOutput = serde_json::from_str(&listing.stdout)
            .map_err(|e| ScanError::Parse(format!("lsblk: {}", e)))?;

        let mut devices = Vec::new();
        for entry in listing
            .blockdevices
            .iter()
            .filter(|d| matches!(d.kind.as_str(), "disk" | "loop"))
            .filter(|d| !d.read_only() && d.size.value() > 0)
        {
            let path = PathBuf::from(&entry.path);
            let sector_size = entry.log_sec.as_ref().map_or(512, Lenient::value);
            let size = entry.size.value();
            let children = entry.child_info();

            let (label, table) = match read_sfdisk(&path, size, sector_size, &children, self.timeouts())
            {
                Ok(Some(table)) => (table.kind.into(), Some(table)),
                Ok(None) if entry.fstype.is_some() => (DiskLabel::Loop, None),
                Ok(None) => (DiskLabel::None, None),
                Err(TableRead::Unsupported(label)) => {
                    warn!("{} carries an unsupported '{}' table", path.display(), label);
                    (DiskLabel::Unknown, None)
                }
                Err(TableRead::Denied(details)) => return Err(ScanError::AccessDenied(details)),
                Err(TableRead::Failed(e)) => {
                    warn!("Could not read table of {}: {}", path.display(), e);
                    (DiskLabel::Unknown, None)
                }
            };
            debug!("Found {} ({}, {} bytes)", path.display(), label, size);
            devices.push(Device {
                path,
                model: entry.model.clone().unwrap_or_default().trim().to_string(),
                sector_size,
                size,
                label,
                table,
            });
        }
        Ok(devices)
    }

    fn tools(&self) -> &dyn FsTools {
        &self.tools
    }
}

fn logical_sector_size(path: &Path) -> u64 {
    let Some(name) = std::fs::canonicalize(path)
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
    else {
        return 512;
    };
    std::fs::read_to_string(format!("/sys/class/block/{}/queue/logical_block_size", name))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(512)
}

/// Exclusive handle on a real block device
struct SystemDevice {
    path: PathBuf,
    file: File,
    size: u64,
    sector_size: u64,
    timeouts: ToolTimeouts,
}

impl SystemDevice {
    fn io(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            device: self.path.display().to_string(),
            source,
        }
    }

    fn bounds(&self, offset: u64, len: usize) -> Result<(), StorageError> {
        if offset.checked_add(len as u64).is_none_or(|end| end > self.size) {
            return Err(StorageError::OutOfBounds {
                device: self.path.display().to_string(),
                offset,
                len: len as u64,
                size: self.size,
            });
        }
        Ok(())
    }
}

impl BlockDevice for SystemDevice {
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
        let children = list_partitions(&self.path, &self.timeouts);
        match read_sfdisk(&self.path, self.size, self.sector_size, &children, &self.timeouts) {
            Ok(table) => Ok(table),
            Err(TableRead::Unsupported(label)) => Err(StorageError::Table {
                device: self.path.display().to_string(),
                details: format!("unsupported table type '{}'", label),
            }),
            Err(TableRead::Denied(details)) => Err(StorageError::Table {
                device: self.path.display().to_string(),
                details,
            }),
            Err(TableRead::Failed(e)) => Err(e),
        }
    }

    fn write_table(&mut self, table: &PartitionTable) -> Result<(), StorageError> {
        let device = self.path.display().to_string();
        let script = sfdisk_script(&self.path, table);
        debug!("sfdisk script for {}:\n{}", device, script);

        // The kernel is told per partition below; a full re-read would
        // fail with EBUSY while we hold the disk
        run_command(
            &ToolCommand::new("sfdisk", self.timeouts.table())
                .args([
                    "--quiet",
                    "--no-reread",
                    "--no-tell-kernel",
                    "--wipe",
                    "never",
                    "--wipe-partitions",
                    "never",
                    device.as_str(),
                ])
                .stdin(script),
        )?;
        self.sync()?;
        run_command(&ToolCommand::new("partx", self.timeouts.table()).args(["--update", device.as_str()]))?;
        if let Err(e) = run_command(&ToolCommand::new("udevadm", self.timeouts.query()).arg("settle")) {
            warn!("udevadm settle failed: {}", e);
        }
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        self.bounds(offset, buf.len())?;
        self.file.read_exact_at(buf, offset).map_err(|e| self.io(e))
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.bounds(offset, data.len())?;
        self.file.write_all_at(data, offset).map_err(|e| self.io(e))
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.file.sync_all().map_err(|e| self.io(e))
    }
}

// ============================================================================
// Table Reading
// ============================================================================

enum TableRead {
    Unsupported(String),
    Denied(String),
    Failed(StorageError),
}

/// What `lsblk` knows about one partition node
#[derive(Debug, Clone, Default)]
struct ChildInfo {
    fs: FileSystem,
    label: Option<String>,
    mount_point: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    size: Lenient,
    #[serde(default)]
    model: Option<String>,
    #[serde(rename = "log-sec", default)]
    log_sec: Option<Lenient>,
    #[serde(default)]
    ro: Option<Lenient>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

impl LsblkDevice {
    fn read_only(&self) -> bool {
        self.ro.as_ref().is_some_and(|r| r.value() != 0)
    }

    fn child_info(&self) -> HashMap<PathBuf, ChildInfo> {
        self.children
            .iter()
            .map(|c| {
                (
                    PathBuf::from(&c.path),
                    ChildInfo {
                        fs: FileSystem::from_fstype(c.fstype.as_deref()),
                        label: c.label.clone(),
                        mount_point: c.mountpoint.clone().map(PathBuf::from),
                    },
                )
            })
            .collect()
    }
}

/// Older `lsblk` prints numbers and booleans as strings
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Lenient {
    Number(u64),
    Bool(bool),
    Text(String),
}

impl Lenient {
    fn value(&self) -> u64 {
        match self {
            Self::Number(n) => *n,
            Self::Bool(b) => u64::from(*b),
            Self::Text(s) => s.trim().parse().unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SfdiskOutput {
    partitiontable: SfdiskTable,
}

#[derive(Debug, Deserialize)]
struct SfdiskTable {
    label: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    firstlba: Option<u64>,
    #[serde(default)]
    sectorsize: Option<u64>,
    #[serde(default)]
    partitions: Vec<SfdiskPartition>,
}

#[derive(Debug, Deserialize)]
struct SfdiskPartition {
    node: String,
    start: u64,
    size: u64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    bootable: bool,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    attrs: Option<String>,
}

fn list_partitions(disk: &Path, timeouts: &ToolTimeouts) -> HashMap<PathBuf, ChildInfo> {
    let cmd = ToolCommand::new("lsblk", timeouts.query()).args([
        "--json",
        "--bytes",
        "--output",
        "PATH,TYPE,SIZE,FSTYPE,LABEL,MOUNTPOINT",
    ]);
    let cmd = cmd.arg(disk.display().to_string());
    run_command(&cmd)
        .ok()
        .and_then(|out| serde_json::from_str::<LsblkOutput>(&out.stdout).ok())
        .and_then(|l| l.blockdevices.into_iter().next())
        .map(|d| d.child_info())
        .unwrap_or_default()
}

fn read_sfdisk(
    disk: &Path,
    device_size: u64,
    sector_size: u64,
    children: &HashMap<PathBuf, ChildInfo>,
    timeouts: &ToolTimeouts,
) -> Result<Option<PartitionTable>, TableRead> {
    let cmd = ToolCommand::new("sfdisk", timeouts.table())
        .arg("--json")
        .arg(disk.display().to_string());
    let out = match run_command(&cmd) {
        Ok(out) => out,
        Err(e) if e.output().contains("does not contain a recognized partition table") => {
            return Ok(None);
        }
        Err(e) if e.output().contains("Permission denied") => {
            return Err(TableRead::Denied(e.output().to_string()));
        }
        Err(e) => return Err(TableRead::Failed(e.into())),
    };
    parse_sfdisk(disk, &out.stdout, device_size, sector_size, children)
}

fn parse_sfdisk(
    disk: &Path,
    json: &str,
    device_size: u64,
    sector_size: u64,
    children: &HashMap<PathBuf, ChildInfo>,
) -> Result<Option<PartitionTable>, TableRead> {
    let failed = |details: String| {
        TableRead::Failed(StorageError::Table {
            device: disk.display().to_string(),
            details,
        })
    };
    let parsed: SfdiskOutput =
        serde_json::from_str(json).map_err(|e| failed(format!("sfdisk output: {}", e)))?;
    let raw = parsed.partitiontable;
    let kind = match raw.label.as_str() {
        "gpt" => TableKind::Gpt,
        "dos" => TableKind::Mbr,
        other => return Err(TableRead::Unsupported(other.to_string())),
    };
    let sector_size = raw.sectorsize.unwrap_or(sector_size);

    let entries: Vec<Partition> = raw
        .partitions
        .iter()
        .filter_map(|p| {
            let number = node_number(&p.node)?;
            let info = children.get(Path::new(&p.node)).cloned().unwrap_or_default();
            let kind_lower = p.kind.to_ascii_lowercase();
            let role = match kind {
                TableKind::Gpt => PartitionRole::Primary,
                TableKind::Mbr if MBR_EXTENDED.contains(&kind_lower.as_str()) => {
                    PartitionRole::Extended
                }
                TableKind::Mbr if number >= 5 => PartitionRole::Logical,
                TableKind::Mbr => PartitionRole::Primary,
            };
            let mut flags = Vec::new();
            if p.bootable {
                flags.push(PartitionFlag::Boot);
            }
            if p.kind.eq_ignore_ascii_case(GPT_ESP) || kind_lower == MBR_ESP {
                flags.push(PartitionFlag::Esp);
            }
            if p.kind.eq_ignore_ascii_case(GPT_BIOS_BOOT) {
                flags.push(PartitionFlag::BiosGrub);
            }
            Some(Partition {
                number,
                start: p.start * sector_size,
                end: (p.start + p.size) * sector_size,
                fs: if role == PartitionRole::Extended {
                    FileSystem::Unformatted
                } else {
                    info.fs
                },
                role,
                mount_point: info.mount_point,
                label: info.label,
                flags,
                identity: EntryIdentity {
                    type_id: Some(p.kind.clone()),
                    uuid: p.uuid.clone(),
                    attrs: p.attrs.clone(),
                    name: p.name.clone(),
                },
            })
        })
        .collect();

    let mut table = PartitionTable::new(kind, device_size, sector_size);
    table.id = raw.id;
    // Older layouts start below the 1 MiB boundary we allocate from
    let lowest = entries
        .iter()
        .filter(|p| p.role != PartitionRole::Logical)
        .map(|p| p.start)
        .chain(raw.firstlba.map(|lba| lba * sector_size))
        .min();
    if let Some(lowest) = lowest {
        table.first_usable = table.first_usable.min(lowest);
    }
    let (top, logical): (Vec<_>, Vec<_>) = entries
        .into_iter()
        .partition(|p| p.role != PartitionRole::Logical);
    for p in top.into_iter().chain(logical) {
        table
            .insert(p)
            .map_err(|e| failed(format!("inconsistent table: {}", e)))?;
    }
    Ok(Some(table))
}

/// Trailing partition number of a node such as `/dev/sda3` or `/dev/nvme0n1p3`.
fn node_number(node: &str) -> Option<u32> {
    let digits = node.len() - node.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    node[node.len() - digits..].parse().ok()
}

// ============================================================================
// Table Writing
// ============================================================================

/// Render `table` as an `sfdisk` input script.
///
/// Entries keep the type, GUID, attributes and name they were read with; only
/// entries without a recorded type get one derived from their filesystem.
fn sfdisk_script(disk: &Path, table: &PartitionTable) -> String {
    let sector = table.sector_size;
    let mut lines = vec![format!("label: {}", table.kind.sfdisk_label())];
    if let Some(id) = &table.id {
        lines.push(format!("label-id: {}", id));
    }
    lines.push("unit: sectors".to_string());
    lines.push(format!("sector-size: {}", sector));
    lines.push(String::new());

    let (top, logical): (Vec<_>, Vec<_>) = table
        .partitions()
        .iter()
        .partition(|p| p.role != PartitionRole::Logical);
    for p in top.into_iter().chain(logical) {
        let identity = &p.identity;
        let kind = match (&identity.type_id, table.kind, p.role) {
            (Some(kind), _, _) => kind.as_str(),
            (None, TableKind::Mbr, PartitionRole::Extended) => "5",
            (None, TableKind::Mbr, _) if p.has_flag(PartitionFlag::Esp) => MBR_ESP,
            (None, TableKind::Mbr, _) => p.fs.mbr_type(),
            (None, TableKind::Gpt, _) if p.has_flag(PartitionFlag::Esp) => GPT_ESP,
            (None, TableKind::Gpt, _) if p.has_flag(PartitionFlag::BiosGrub) => GPT_BIOS_BOOT,
            (None, TableKind::Gpt, _) => p.fs.gpt_type(),
        };
        let mut line = format!(
            "{} : start={}, size={}, type={}",
            partition_path(disk, p.number).display(),
            p.start / sector,
            p.size() / sector,
            kind
        );
        if table.kind == TableKind::Mbr && p.has_flag(PartitionFlag::Boot) {
            line.push_str(", bootable");
        }
        if table.kind == TableKind::Gpt {
            if let Some(uuid) = &identity.uuid {
                line.push_str(&format!(", uuid={}", uuid));
            }
            if let Some(name) = &identity.name {
                line.push_str(&format!(", name=\"{}\"", name.replace('"', "")));
            }
            if let Some(attrs) = &identity.attrs {
                line.push_str(&format!(", attrs=\"{}\"", attrs.replace('"', "")));
            }
        }
        lines.push(line);
    }
    lines.push(String::new());
    lines.join("\n")
}

// ============================================================================
// Filesystem Tools
// ============================================================================

/// Filesystem utilities of the running system
#[derive(Debug, Clone, Default)]
pub struct SystemTools {
    timeouts: ToolTimeouts,
}

impl FsTools for SystemTools {
    fn mkfs(&self, node: &Path, fs: FileSystem, label: Option<&str>) -> Result<(), CommandError> {
        let Some((program, args)) = fs.mkfs_command(label) else {
            return Ok(());
        };
        run_command(
            &ToolCommand::new(program, self.timeouts.mkfs())
                .args(args)
                .arg(node.display().to_string()),
        )?;
        Ok(())
    }

    fn fsck(&self, node: &Path, fs: FileSystem) -> Result<(), CommandError> {
        let Some((program, args)) = fs.fsck_command() else {
            debug!("No checker for {}, skipping {}", fs, node.display());
            return Ok(());
        };
        run_command(
            &ToolCommand::new(program, self.timeouts.fsck())
                .args(args)
                .arg(node.display().to_string()),
        )?;
        Ok(())
    }

    fn resize(&self, node: &Path, fs: FileSystem, new_size: u64) -> Result<(), CommandError> {
        let node_str = node.display().to_string();
        let timeout = self.timeouts.resize();
        let cmd = match fs {
            FileSystem::Unformatted => return Ok(()),
            FileSystem::Ext2 | FileSystem::Ext3 | FileSystem::Ext4 => {
                ToolCommand::new("resize2fs", timeout).args([
                    "-f".to_string(),
                    node_str,
                    format!("{}K", new_size / 1024),
                ])
            }
            FileSystem::Ntfs => ToolCommand::new("ntfsresize", timeout)
                .args([
                    "--force".to_string(),
                    "--no-progress-bar".to_string(),
                    "--size".to_string(),
                    new_size.to_string(),
                    node_str,
                ])
                .stdin("y\n"),
            // Swap carries no data worth keeping; recreate it at the new size
            FileSystem::LinuxSwap => ToolCommand::new("mkswap", timeout).arg(node_str),
            other => {
                return Err(CommandError::FailedToStart {
                    command: format!("resize {}", node_str),
                    details: format!("no resize tool for {}", other),
                });
            }
        };
        run_command(&cmd)?;
        Ok(())
    }

    fn min_size(&self, node: &Path, fs: FileSystem) -> Result<Option<u64>, CommandError> {
        let node_str = node.display().to_string();
        let timeout = self.timeouts.query();
        match fs {
            FileSystem::Ext2 | FileSystem::Ext3 | FileSystem::Ext4 => {
                let blocks = run_command(
                    &ToolCommand::new("resize2fs", timeout).args(["-P", node_str.as_str()]),
                )?;
                let header = run_command(
                    &ToolCommand::new("dumpe2fs", timeout).args(["-h", node_str.as_str()]),
                )?;
                Ok(parse_ext_min_size(&blocks.stdout, &header.stdout))
            }
            FileSystem::Ntfs => {
                let out = run_command(&ToolCommand::new("ntfsresize", timeout).args([
                    "--info",
                    "--force",
                    "--no-progress-bar",
                    node_str.as_str(),
                ]))?;
                Ok(parse_ntfs_min_size(&out.stdout))
            }
            _ => Ok(None),
        }
    }
}

fn value_after<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines()
        .find_map(|l| l.split_once(key).map(|(_, rest)| rest.trim()))
}

fn parse_ext_min_size(resize2fs: &str, dumpe2fs: &str) -> Option<u64> {
    let blocks: u64 = value_after(resize2fs, "minimum size of the filesystem:")?
        .parse()
        .ok()?;
    let block_size: u64 = value_after(dumpe2fs, "Block size:")?.parse().ok()?;
    Some(blocks * block_size)
}

fn parse_ntfs_min_size(info: &str) -> Option<u64> {
    value_after(info, "You might resize at")?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MIB;

    const GPT_JSON: &str = r#"{
       "partitiontable": {
          "label": "gpt",
          "id": "5B6A2A4E-1B0E-4F43-9E26-5E0A5A7B2C11",
          "device": "/dev/sda",
          "unit": "sectors",
          "firstlba": 2048,
          "lastlba": 204766,
          "sectorsize": 512,
          "partitions": [
             {"node": "/dev/sda1", "start": 2048, "size": 102400, "type": "C12A7328-F81F-11D2-BA4B-00A0C93EC93B", "uuid": "A", "name": "EFI"},
             {"node": "/dev/sda2", "start": 104448, "size": 98304, "type": "0FC63DAF-8483-4772-8E79-3D69D8477DE4", "uuid": "B"}
          ]
       }
    }"#;

    const DOS_JSON: &str = r#"{
       "partitiontable": {
          "label": "dos",
          "id": "0x1234",
          "device": "/dev/sdb",
          "unit": "sectors",
          "sectorsize": 512,
          "partitions": [
             {"node": "/dev/sdb1", "start": 2048, "size": 204800, "type": "83", "bootable": true},
             {"node": "/dev/sdb2", "start": 206848, "size": 409600, "type": "5"},
             {"node": "/dev/sdb5", "start": 208896, "size": 102400, "type": "82"}
          ]
       }
    }"#;

    #[test]
    fn test_parse_gpt() {
        let mut children = HashMap::new();
        children.insert(
            PathBuf::from("/dev/sda2"),
            ChildInfo {
                fs: FileSystem::Ext4,
                label: Some("root".into()),
                mount_point: None,
            },
        );
        let Ok(Some(table)) =
            parse_sfdisk(Path::new("/dev/sda"), GPT_JSON, 100 * MIB, 512, &children)
        else {
            panic!("gpt table did not parse");
        };
        assert_eq!(table.kind, TableKind::Gpt);
        let esp = table.find(1).unwrap();
        assert!(esp.has_flag(PartitionFlag::Esp));
        assert_eq!(esp.start, MIB);
        assert_eq!(esp.label, None);
        assert_eq!(esp.identity.name.as_deref(), Some("EFI"));
        assert_eq!(esp.identity.uuid.as_deref(), Some("A"));
        assert_eq!(table.id.as_deref(), Some("5B6A2A4E-1B0E-4F43-9E26-5E0A5A7B2C11"));
        let root = table.find(2).unwrap();
        assert_eq!(root.fs, FileSystem::Ext4);
        assert_eq!(root.label.as_deref(), Some("root"));
    }

    #[test]
    fn test_parse_dos_with_logical() {
        let Ok(Some(table)) =
            parse_sfdisk(Path::new("/dev/sdb"), DOS_JSON, 1024 * MIB, 512, &HashMap::new())
        else {
            panic!("dos table did not parse");
        };
        assert_eq!(table.kind, TableKind::Mbr);
        assert!(table.find(1).unwrap().has_flag(PartitionFlag::Boot));
        assert_eq!(table.find(2).unwrap().role, PartitionRole::Extended);
        assert_eq!(table.find(5).unwrap().role, PartitionRole::Logical);
        assert_eq!(table.primary_count(), 2);
    }

    #[test]
    fn test_unsupported_label() {
        let json = r#"{"partitiontable": {"label": "sun", "partitions": []}}"#;
        let result = parse_sfdisk(Path::new("/dev/sdc"), json, MIB * 10, 512, &HashMap::new());
        assert!(matches!(result, Err(TableRead::Unsupported(l)) if l == "sun"));
    }

    #[test]
    fn test_node_number() {
        assert_eq!(node_number("/dev/sda12"), Some(12));
        assert_eq!(node_number("/dev/nvme0n1p3"), Some(3));
        assert_eq!(node_number("/dev/sda"), None);
    }

    #[test]
    fn test_script_roundtrips_through_parser_layout() {
        let Ok(Some(table)) =
            parse_sfdisk(Path::new("/dev/sdb"), DOS_JSON, 1024 * MIB, 512, &HashMap::new())
        else {
            panic!("dos table did not parse");
        };
        let script = sfdisk_script(Path::new("/dev/sdb"), &table);
        assert!(script.starts_with("label: dos\nunit: sectors\nsector-size: 512\n"));
        assert!(script.contains("/dev/sdb1 : start=2048, size=204800, type=83, bootable"));
        assert!(script.contains("/dev/sdb2 : start=206848, size=409600, type=5"));
        assert!(script.contains("/dev/sdb5 : start=208896, size=102400, type=82"));
    }

    #[test]
    fn test_gpt_script_names_and_esp() {
        let Ok(Some(table)) =
            parse_sfdisk(Path::new("/dev/sda"), GPT_JSON, 100 * MIB, 512, &HashMap::new())
        else {
            panic!("gpt table did not parse");
        };
        let script = sfdisk_script(Path::new("/dev/sda"), &table);
        assert!(script.contains("label-id: 5B6A2A4E-1B0E-4F43-9E26-5E0A5A7B2C11\n"));
        assert!(script.contains(&format!("type={}, uuid=A, name=\"EFI\"", GPT_ESP)));
    }

    const DUAL_BOOT_JSON: &str = r#"{
       "partitiontable": {
          "label": "gpt",
          "id": "9D4C1E52-7A11-4B7C-8F7E-0C1D2E3F4A5B",
          "device": "/dev/sda",
          "unit": "sectors",
          "firstlba": 2048,
          "lastlba": 2097118,
          "sectorsize": 512,
          "partitions": [
             {"node": "/dev/sda1", "start": 2048, "size": 32768, "type": "E3C9E316-0B5C-4DB8-817D-F92DF00215AE",
              "uuid": "11111111-2222-3333-4444-555555555555", "name": "Microsoft reserved partition"},
             {"node": "/dev/sda2", "start": 34816, "size": 1024000, "type": "DE94BBA4-06D1-4D40-A16A-BFD50179D6AC",
              "uuid": "66666666-7777-8888-9999-AAAAAAAAAAAA", "name": "Recovery", "attrs": "RequiredPartition GUID:63"}
          ]
       }
    }"#;

    #[test]
    fn test_untouched_entries_keep_identity() {
        let mut children = HashMap::new();
        children.insert(
            PathBuf::from("/dev/sda2"),
            ChildInfo {
                fs: FileSystem::Ntfs,
                label: Some("Windows RE tools".into()),
                mount_point: None,
            },
        );
        let Ok(Some(mut table)) =
            parse_sfdisk(Path::new("/dev/sda"), DUAL_BOOT_JSON, 1024 * MIB, 512, &children)
        else {
            panic!("gpt table did not parse");
        };
        table
            .add_partition(crate::model::NewPartition {
                start: None,
                size: 100 * MIB,
                fs: FileSystem::Ext4,
                role: PartitionRole::Primary,
                label: Some("root".into()),
                mount_point: None,
                flags: Vec::new(),
            })
            .unwrap();

        let script = sfdisk_script(Path::new("/dev/sda"), &table);
        assert!(script.contains("label-id: 9D4C1E52-7A11-4B7C-8F7E-0C1D2E3F4A5B\n"));
        assert!(script.contains(
            "/dev/sda1 : start=2048, size=32768, type=E3C9E316-0B5C-4DB8-817D-F92DF00215AE, \
             uuid=11111111-2222-3333-4444-555555555555, name=\"Microsoft reserved partition\""
        ));
        assert!(script.contains(
            "/dev/sda2 : start=34816, size=1024000, type=DE94BBA4-06D1-4D40-A16A-BFD50179D6AC, \
             uuid=66666666-7777-8888-9999-AAAAAAAAAAAA, name=\"Recovery\", attrs=\"RequiredPartition GUID:63\""
        ));
        // The filesystem label never leaks into the entry name
        assert!(!script.contains("Windows RE tools"));
        assert!(!script.contains("\"root\""));
        // Only the new entry gets a type derived from its filesystem
        assert!(script.contains(&format!("/dev/sda3 : start=1058816, size=204800, type={}\n", FileSystem::Ext4.gpt_type())));
    }

    #[test]
    fn test_formatted_entry_type_follows_filesystem() {
        let Ok(Some(mut table)) =
            parse_sfdisk(Path::new("/dev/sda"), DUAL_BOOT_JSON, 1024 * MIB, 512, &HashMap::new())
        else {
            panic!("gpt table did not parse");
        };
        table.set_filesystem(2, FileSystem::Ext4, None).unwrap();
        let script = sfdisk_script(Path::new("/dev/sda"), &table);
        assert!(script.contains(&format!(
            "/dev/sda2 : start=34816, size=1024000, type={}, uuid=66666666-7777-8888-9999-AAAAAAAAAAAA",
            FileSystem::Ext4.gpt_type()
        )));
        assert!(script.contains("type=E3C9E316-0B5C-4DB8-817D-F92DF00215AE"));
    }

    #[test]
    fn test_lsblk_lenient_numbers() {
        let json = r#"{"blockdevices": [
            {"path": "/dev/sda", "type": "disk", "size": "1000204886016", "model": "Disk ", "log-sec": "512", "ro": "0",
             "children": [{"path": "/dev/sda1", "type": "part", "size": 536870912, "fstype": "vfat", "label": "EFI", "mountpoint": "/boot"}]},
            {"path": "/dev/sr0", "type": "rom", "size": 1073741312, "ro": true}
        ]}"#;
        let listing: LsblkOutput = serde_json::from_str(json).unwrap();
        let disk = &listing.blockdevices[0];
        assert_eq!(disk.size.value(), 1_000_204_886_016);
        assert!(!disk.read_only());
        assert!(listing.blockdevices[1].read_only());
        let children = disk.child_info();
        let esp = &children[Path::new("/dev/sda1")];
        assert_eq!(esp.fs, FileSystem::Fat32);
        assert_eq!(esp.mount_point.as_deref(), Some(Path::new("/boot")));
    }

    #[test]
    fn test_parse_ext_min_size() {
        let resize = "resize2fs 1.47.0 (5-Feb-2023)\nEstimated minimum size of the filesystem: 123456\n";
        let dump = "Filesystem volume name:   <none>\nBlock size:               4096\n";
        assert_eq!(parse_ext_min_size(resize, dump), Some(123456 * 4096));
        assert_eq!(parse_ext_min_size("garbage", dump), None);
    }

    #[test]
    fn test_parse_ntfs_min_size() {
        let info = "ntfsresize v2022.10.3\nYou might resize at 52428800 bytes or 53 MB (freeing 947 MB).\n";
        assert_eq!(parse_ntfs_min_size(info), Some(52_428_800));
    }
}
