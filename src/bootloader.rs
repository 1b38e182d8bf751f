//! Boot Loader Resolver
//!
//! Decides where the boot loader goes, given the firmware mode and the
//! planned layout.
//!
//! # Resolution Rules
//!
//! | Firmware | Selection        | Target |
//! |----------|------------------|--------|
//! | any      | `none`           | no boot loader |
//! | UEFI     | unset            | first ESP on the boot device, then on other devices |
//! | UEFI     | partition        | that partition, which must be an ESP |
//! | BIOS     | unset            | Master Boot Record of the boot device |
//! | BIOS     | device           | Master Boot Record of that device |
//! | BIOS     | partition        | boot record of that partition |
//!
//! There is no BIOS fallback on UEFI machines: without an ESP the result is
//! `BootTargetUnavailable` and no plan is produced.
//!
//! Pure logic: reads the model, performs no I/O.

use crate::error::JobError;
use crate::hardware::FirmwareMode;
use crate::jobs::disk_name;
use crate::model::{partition_path, DeviceModel, Partition, PartitionRef};
use crate::types::{PartitionFlag, PartitionRole, TableKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

const ESP_MISSING: &str = "An EFI system partition is necessary to start the system. \
To configure an EFI system partition, select or create a FAT32 file system with the \
esp flag enabled and mount point /boot/efi.";

/// Operator's explicit boot-loader choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BootSelection {
    /// "Do not install a boot loader"
    None,
    /// A device or partition node
    Path(PathBuf),
}

impl FromStr for BootSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("boot selection must not be empty".to_string());
        }
        if s.eq_ignore_ascii_case("none") {
            Ok(Self::None)
        } else {
            Ok(Self::Path(PathBuf::from(s)))
        }
    }
}

impl TryFrom<String> for BootSelection {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<BootSelection> for String {
    fn from(selection: BootSelection) -> Self {
        match selection {
            BootSelection::None => "none".to_string(),
            BootSelection::Path(p) => p.display().to_string(),
        }
    }
}

/// Where the boot loader will be installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "lowercase")]
pub enum BootLoaderTarget {
    None,
    /// Boot record of a whole disk, or of a partition on BIOS machines
    Mbr(PathBuf),
    /// EFI System Partition node
    Esp(PathBuf),
}

impl BootLoaderTarget {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::None => None,
            Self::Mbr(p) | Self::Esp(p) => Some(p),
        }
    }

    /// Operator-facing label, resolved against the planned layout.
    pub fn label(&self, model: &DeviceModel) -> String {
        match self {
            Self::None => "Do not install a boot loader".to_string(),
            Self::Mbr(path) => match model.device(path) {
                Some(dev) => format!("Master Boot Record of {}", disk_name(path, &dev.model)),
                None => partition_label(model, path),
            },
            Self::Esp(path) => partition_label(model, path),
        }
    }
}

impl fmt::Display for BootLoaderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Mbr(p) => write!(f, "mbr:{}", p.display()),
            Self::Esp(p) => write!(f, "esp:{}", p.display()),
        }
    }
}

/// "%1 (%2)" where %2 names the partition's role in the installed system.
fn partition_label(model: &DeviceModel, node: &Path) -> String {
    let mount = find_by_node(model, node).and_then(|(_, p)| p.mount_point.clone());
    let role = match mount.as_deref().and_then(Path::to_str) {
        Some("/boot") => Some("Boot Partition"),
        Some("/") => Some("System Partition"),
        _ => None,
    };
    match role {
        Some(role) => format!("{} ({})", node.display(), role),
        None => node.display().to_string(),
    }
}

fn find_by_node<'m>(model: &'m DeviceModel, node: &Path) -> Option<(PartitionRef, &'m Partition)> {
    model.devices().iter().find_map(|dev| {
        let table = dev.table.as_ref()?;
        table
            .partitions()
            .iter()
            .find(|p| partition_path(&dev.path, p.number) == node)
            .map(|p| (PartitionRef::new(dev.path.clone(), p.number), p))
    })
}

fn unavailable(details: impl Into<String>) -> JobError {
    JobError::BootTargetUnavailable {
        details: details.into(),
    }
}

/// ESP nodes, boot device first.
fn esp_candidates(model: &DeviceModel, boot_device: &Path) -> Vec<PathBuf> {
    let mut devices: Vec<_> = model.devices().iter().collect();
    devices.sort_by_key(|d| d.path != boot_device);
    devices
        .into_iter()
        .filter_map(|d| d.table.as_ref().map(|t| (d, t)))
        .flat_map(|(d, t)| {
            t.partitions()
                .iter()
                .filter(|p| p.has_flag(PartitionFlag::Esp))
                .map(|p| partition_path(&d.path, p.number))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Resolve the boot-loader target for `firmware` against the planned layout.
pub fn resolve(
    model: &DeviceModel,
    firmware: FirmwareMode,
    boot_device: &Path,
    selection: Option<&BootSelection>,
) -> Result<BootLoaderTarget, JobError> {
    let target = match (firmware, selection) {
        (_, Some(BootSelection::None)) => BootLoaderTarget::None,
        (FirmwareMode::Uefi, Some(BootSelection::Path(path))) => {
            let (_, part) = find_by_node(model, path).ok_or_else(|| {
                unavailable(format!("{} is not a partition.\n{}", path.display(), ESP_MISSING))
            })?;
            if !part.has_flag(PartitionFlag::Esp) {
                return Err(unavailable(format!(
                    "Partition {} is not flagged as EFI system partition.\n{}",
                    path.display(),
                    ESP_MISSING
                )));
            }
            BootLoaderTarget::Esp(path.clone())
        }
        (FirmwareMode::Uefi, None) => {
            let candidates = esp_candidates(model, boot_device);
            debug!("ESP candidates: {:?}", candidates);
            let esp = candidates.into_iter().next().ok_or_else(|| unavailable(ESP_MISSING))?;
            BootLoaderTarget::Esp(esp)
        }
        (FirmwareMode::Bios, Some(BootSelection::Path(path))) => {
            if model.device(path).is_none() && find_by_node(model, path).is_none() {
                return Err(unavailable(format!(
                    "{} is neither a known device nor a partition.",
                    path.display()
                )));
            }
            BootLoaderTarget::Mbr(path.clone())
        }
        (FirmwareMode::Bios, None) => {
            let dev = model.device(boot_device).ok_or_else(|| {
                unavailable(format!("Boot device {} was not found.", boot_device.display()))
            })?;
            if let Some(table) = &dev.table {
                let bios_grub = table
                    .partitions()
                    .iter()
                    .any(|p| p.has_flag(PartitionFlag::BiosGrub));
                if table.kind == TableKind::Gpt && !bios_grub {
                    warn!(
                        "{} uses GPT without a bios_grub partition; some boot loaders need one",
                        dev.path.display()
                    );
                }
            }
            BootLoaderTarget::Mbr(dev.path.clone())
        }
    };
    info!("Boot loader target ({}): {}", firmware, target);
    Ok(target)
}

/// Every target the operator may pick, default first.
pub fn options(model: &DeviceModel, firmware: FirmwareMode, boot_device: &Path) -> Vec<BootLoaderTarget> {
    let mut options: Vec<BootLoaderTarget> = match firmware {
        FirmwareMode::Uefi => esp_candidates(model, boot_device)
            .into_iter()
            .map(BootLoaderTarget::Esp)
            .collect(),
        FirmwareMode::Bios => {
            let mut devices: Vec<_> = model.devices().iter().collect();
            devices.sort_by_key(|d| d.path != boot_device);
            let mut found = Vec::new();
            for dev in devices {
                found.push(BootLoaderTarget::Mbr(dev.path.clone()));
                if let Some(table) = &dev.table {
                    found.extend(
                        table
                            .partitions()
                            .iter()
                            .filter(|p| p.role != PartitionRole::Extended)
                            .map(|p| BootLoaderTarget::Mbr(partition_path(&dev.path, p.number))),
                    );
                }
            }
            found
        }
    };
    options.push(BootLoaderTarget::None);
    options
}
