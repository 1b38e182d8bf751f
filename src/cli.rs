use crate::types::BootMode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// partjob - partition mutation jobs for system installers
#[derive(Parser, Debug)]
#[command(name = "partjob")]
#[command(about = "Plan and run partition table, format, resize and move jobs")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: run the plan against an in-memory copy of the scanned
    /// devices instead of the real disks.
    ///
    /// Device enumeration still executes so the preview is realistic.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Run configuration file (tool timeouts, copy chunk size)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List block devices and their partition tables
    Scan {
        /// Print the device model as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate a plan file and print the resulting job list
    Plan {
        /// Path to the JSON plan file
        plan: PathBuf,
    },
    /// Execute a plan file
    Run {
        /// Path to the JSON plan file
        plan: PathBuf,
        /// Confirm destructive jobs (format, delete, new partition table)
        #[arg(short, long)]
        yes: bool,
    },
    /// Show where the boot loader would be installed
    Bootloader {
        /// Firmware mode (auto, uefi or bios)
        #[arg(short, long, default_value = "auto", value_parser = parse_boot_mode)]
        firmware: BootMode,
        /// Device the system will boot from (e.g., /dev/sda)
        #[arg(short, long)]
        device: PathBuf,
        /// Explicit choice: a device, a partition, or "none"
        #[arg(short, long)]
        select: Option<String>,
        /// Print the target as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write the default run configuration to a file
    DefaultConfig {
        /// Destination path
        output: PathBuf,
    },
}

fn parse_boot_mode(s: &str) -> Result<BootMode, String> {
    match s.to_ascii_lowercase().as_str() {
        "auto" => Ok(BootMode::Auto),
        "uefi" | "efi" => Ok(BootMode::Uefi),
        "bios" => Ok(BootMode::Bios),
        other => Err(format!("unknown firmware mode '{}', expected auto, uefi or bios", other)),
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
