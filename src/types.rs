//! Type-safe vocabulary shared by the model, jobs and plan files
//!
//! These enums replace stringly-typed filesystem and table names with proper
//! Rust enums that provide compile-time validation and exhaustive matching.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Boot firmware mode as requested by a plan file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum BootMode {
    /// Use whatever the running system was booted with
    #[default]
    #[strum(serialize = "Auto")]
    Auto,
    #[strum(serialize = "UEFI")]
    Uefi,
    #[strum(serialize = "BIOS")]
    Bios,
}

/// Filesystem kind carried by a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FileSystem {
    /// Partition entry exists but carries no filesystem
    #[default]
    Unformatted,
    Ext2,
    Ext3,
    Ext4,
    Btrfs,
    Xfs,
    F2fs,
    Fat16,
    Fat32,
    Ntfs,
    #[strum(serialize = "linuxswap", serialize = "swap")]
    #[serde(alias = "swap")]
    LinuxSwap,
    /// Something we found on disk but do not know how to handle
    Unknown,
}

impl FileSystem {
    /// Tool and arguments that create this filesystem, without the target node.
    pub fn mkfs_command(self, label: Option<&str>) -> Option<(&'static str, Vec<String>)> {
        let mut args: Vec<String> = Vec::new();
        let program = match self {
            Self::Ext2 | Self::Ext3 | Self::Ext4 => {
                args.push("-F".into());
                if let Some(l) = label {
                    args.extend(["-L".into(), l.into()]);
                }
                match self {
                    Self::Ext2 => "mkfs.ext2",
                    Self::Ext3 => "mkfs.ext3",
                    _ => "mkfs.ext4",
                }
            }
            Self::Btrfs => {
                args.push("-f".into());
                if let Some(l) = label {
                    args.extend(["-L".into(), l.into()]);
                }
                "mkfs.btrfs"
            }
            Self::Xfs => {
                args.push("-f".into());
                if let Some(l) = label {
                    args.extend(["-L".into(), l.into()]);
                }
                "mkfs.xfs"
            }
            Self::F2fs => {
                args.push("-f".into());
                if let Some(l) = label {
                    args.extend(["-l".into(), l.into()]);
                }
                "mkfs.f2fs"
            }
            Self::Fat16 | Self::Fat32 => {
                let bits = if self == Self::Fat16 { "16" } else { "32" };
                args.extend(["-F".into(), bits.into()]);
                if let Some(l) = label {
                    args.extend(["-n".into(), l.into()]);
                }
                "mkfs.fat"
            }
            Self::Ntfs => {
                args.extend(["-Q".into(), "-F".into()]);
                if let Some(l) = label {
                    args.extend(["-L".into(), l.into()]);
                }
                "mkfs.ntfs"
            }
            Self::LinuxSwap => {
                if let Some(l) = label {
                    args.extend(["-L".into(), l.into()]);
                }
                "mkswap"
            }
            Self::Unformatted | Self::Unknown => return None,
        };
        Some((program, args))
    }

    /// Tool and arguments for a non-interactive, read-only consistency check.
    pub fn fsck_command(self) -> Option<(&'static str, Vec<String>)> {
        match self {
            Self::Ext2 | Self::Ext3 | Self::Ext4 => {
                Some(("e2fsck", vec!["-f".into(), "-n".into()]))
            }
            Self::Btrfs => Some(("btrfs", vec!["check".into(), "--readonly".into()])),
            Self::Xfs => Some(("xfs_repair", vec!["-n".into()])),
            Self::F2fs => Some(("fsck.f2fs", vec!["--dry-run".into()])),
            Self::Fat16 | Self::Fat32 => Some(("fsck.fat", vec!["-n".into()])),
            Self::Ntfs => Some(("ntfsfix", vec!["--no-action".into()])),
            Self::LinuxSwap | Self::Unformatted | Self::Unknown => None,
        }
    }

    /// Whether the filesystem stores its own start sector in a BPB-style boot sector.
    pub fn has_boot_sector(self) -> bool {
        matches!(self, Self::Fat16 | Self::Fat32 | Self::Ntfs)
    }

    /// Whether the filesystem can be resized offline by a tool we drive.
    pub fn supports_resize(self) -> bool {
        matches!(
            self,
            Self::Ext2 | Self::Ext3 | Self::Ext4 | Self::Ntfs | Self::LinuxSwap | Self::Unformatted
        )
    }

    /// MBR system id used when writing a table entry.
    pub fn mbr_type(self) -> &'static str {
        match self {
            Self::Fat16 => "6",
            Self::Fat32 => "c",
            Self::Ntfs => "7",
            Self::LinuxSwap => "82",
            _ => "83",
        }
    }

    /// GPT partition type GUID used when writing a table entry.
    pub fn gpt_type(self) -> &'static str {
        match self {
            Self::Fat16 | Self::Fat32 | Self::Ntfs => "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7",
            Self::LinuxSwap => "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F",
            _ => "0FC63DAF-8483-4772-8E79-3D69D8477DE4",
        }
    }

    /// Map a `lsblk`/`blkid` FSTYPE string onto a known filesystem.
    pub fn from_fstype(fstype: Option<&str>) -> Self {
        match fstype.map(str::trim) {
            None | Some("") => Self::Unformatted,
            Some("vfat") => Self::Fat32,
            Some("swap") => Self::LinuxSwap,
            Some(other) => other.parse().unwrap_or(Self::Unknown),
        }
    }
}

/// Partition table format written by a CreatePartitionTable job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    #[strum(serialize = "MBR", serialize = "msdos", serialize = "dos", serialize = "mbr")]
    Mbr,
    #[strum(serialize = "GPT", serialize = "gpt")]
    Gpt,
}

impl TableKind {
    /// Label name understood by `sfdisk`.
    pub fn sfdisk_label(self) -> &'static str {
        match self {
            Self::Mbr => "dos",
            Self::Gpt => "gpt",
        }
    }
}

/// What a scan found at the start of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DiskLabel {
    /// No table at all, the device is unpartitioned
    #[default]
    None,
    /// Something is there but we cannot parse it
    Unknown,
    Mbr,
    Gpt,
    /// Loop device carrying a filesystem directly
    Loop,
}

impl From<TableKind> for DiskLabel {
    fn from(kind: TableKind) -> Self {
        match kind {
            TableKind::Mbr => Self::Mbr,
            TableKind::Gpt => Self::Gpt,
        }
    }
}

/// Role of a partition entry inside its table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PartitionRole {
    #[default]
    Primary,
    Extended,
    Logical,
}

/// Flags relevant to boot loader placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PartitionFlag {
    Boot,
    Esp,
    BiosGrub,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_boot_mode_display() {
        assert_eq!(BootMode::Uefi.to_string(), "UEFI");
        assert_eq!(BootMode::Bios.to_string(), "BIOS");
        assert_eq!(BootMode::Auto.to_string(), "Auto");
    }

    #[test]
    fn test_boot_mode_serde_is_lowercase() {
        let json = serde_json::to_string(&BootMode::Uefi).unwrap();
        assert_eq!(json, "\"uefi\"");
        let parsed: BootMode = serde_json::from_str("\"bios\"").unwrap();
        assert_eq!(parsed, BootMode::Bios);
    }

    #[test]
    fn test_filesystem_parsing() {
        assert_eq!(FileSystem::from_str("ext4").unwrap(), FileSystem::Ext4);
        assert_eq!(FileSystem::from_str("swap").unwrap(), FileSystem::LinuxSwap);
        assert_eq!(FileSystem::from_str("fat32").unwrap(), FileSystem::Fat32);
        assert!(FileSystem::from_str("reiser5").is_err());
    }

    #[test]
    fn test_filesystem_from_fstype() {
        assert_eq!(FileSystem::from_fstype(None), FileSystem::Unformatted);
        assert_eq!(FileSystem::from_fstype(Some("vfat")), FileSystem::Fat32);
        assert_eq!(FileSystem::from_fstype(Some("swap")), FileSystem::LinuxSwap);
        assert_eq!(FileSystem::from_fstype(Some("zfs_member")), FileSystem::Unknown);
    }

    #[test]
    fn test_every_creatable_filesystem_has_mkfs() {
        for fs in FileSystem::iter() {
            let creatable = !matches!(fs, FileSystem::Unformatted | FileSystem::Unknown);
            assert_eq!(fs.mkfs_command(None).is_some(), creatable, "{:?}", fs);
        }
    }

    #[test]
    fn test_mkfs_label_flags() {
        let (prog, args) = FileSystem::Fat32.mkfs_command(Some("EFI")).unwrap();
        assert_eq!(prog, "mkfs.fat");
        assert_eq!(args, vec!["-F", "32", "-n", "EFI"]);

        let (prog, args) = FileSystem::Ext4.mkfs_command(None).unwrap();
        assert_eq!(prog, "mkfs.ext4");
        assert_eq!(args, vec!["-F"]);
    }

    #[test]
    fn test_swap_has_no_checker() {
        assert!(FileSystem::LinuxSwap.fsck_command().is_none());
        assert!(FileSystem::Ext4.fsck_command().is_some());
    }

    #[test]
    fn test_table_kind_aliases() {
        assert_eq!(TableKind::from_str("msdos").unwrap(), TableKind::Mbr);
        assert_eq!(TableKind::from_str("gpt").unwrap(), TableKind::Gpt);
        assert_eq!(TableKind::Mbr.to_string(), "MBR");
        assert_eq!(TableKind::Gpt.sfdisk_label(), "gpt");
    }

    #[test]
    fn test_flag_serde() {
        let json = serde_json::to_string(&PartitionFlag::BiosGrub).unwrap();
        assert_eq!(json, "\"bios_grub\"");
    }
}
