//! Firmware mode detection
//!
//! The boot-loader resolver needs to know whether the machine booted through
//! UEFI or legacy BIOS. The kernel exposes `/sys/firmware/efi` only in UEFI
//! mode; that is the whole test.

use crate::types::BootMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use strum::{Display, EnumIter, EnumString};
use tracing::{info, warn};

const EFI_SYSFS: &str = "/sys/firmware/efi";

/// Firmware the running system booted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareMode {
    /// UEFI firmware; the boot loader lives on an EFI System Partition
    #[strum(serialize = "UEFI", serialize = "uefi")]
    Uefi,
    /// Legacy BIOS; the boot loader goes into a Master Boot Record
    #[strum(serialize = "BIOS", serialize = "bios")]
    Bios,
}

impl FirmwareMode {
    pub fn is_uefi(self) -> bool {
        matches!(self, Self::Uefi)
    }

    pub fn is_bios(self) -> bool {
        matches!(self, Self::Bios)
    }
}

/// Detect firmware mode by checking for the EFI sysfs directory.
pub fn detect_firmware_mode() -> FirmwareMode {
    detect_firmware_mode_at(Path::new(EFI_SYSFS))
}

/// Same as [`detect_firmware_mode`], probing `efi_dir` instead of sysfs.
pub fn detect_firmware_mode_at(efi_dir: &Path) -> FirmwareMode {
    if efi_dir.is_dir() {
        if !efi_dir.join("efivars").exists() {
            warn!(
                "{} exists but efivars not found, EFI variables may not be writable",
                efi_dir.display()
            );
        }
        info!("UEFI firmware detected ({} exists)", efi_dir.display());
        FirmwareMode::Uefi
    } else {
        info!("BIOS firmware detected ({} not found)", efi_dir.display());
        FirmwareMode::Bios
    }
}

impl BootMode {
    /// Concrete firmware mode, probing the machine for `Auto`.
    pub fn resolve(self) -> FirmwareMode {
        self.resolve_with(detect_firmware_mode)
    }

    pub fn resolve_with(self, detect: impl FnOnce() -> FirmwareMode) -> FirmwareMode {
        match self {
            Self::Uefi => FirmwareMode::Uefi,
            Self::Bios => FirmwareMode::Bios,
            Self::Auto => detect(),
        }
    }
}
