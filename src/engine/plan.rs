//! Plan Engine
//!
//! Translates a JSON plan file into an ordered, validated [`Job`] list plus a
//! boot-loader decision.
//!
//! # Plan file
//!
//! ```json
//! {
//!   "firmware": "uefi",
//!   "boot_device": "/dev/sda",
//!   "jobs": [
//!     { "kind": "create_partition_table", "device": "/dev/sda", "table": "gpt" },
//!     { "kind": "create_partition", "device": "/dev/sda", "size_mb": 512,
//!       "filesystem": "fat32", "mount_point": "/boot/efi", "flags": ["esp"] },
//!     { "kind": "create_partition", "device": "/dev/sda", "size_mb": 20000,
//!       "filesystem": "ext4", "mount_point": "/" }
//!   ]
//! }
//! ```
//!
//! # Design
//!
//! - **Simulated**: every entry is applied to a scratch copy of the device
//!   model, so later entries may refer to partitions created by earlier ones
//!   and the boot-loader resolver sees the final layout
//! - **Guarded moves**: a file system check is inserted in front of every move
//! - **Pure logic**: no device is opened; the queue does the work

use crate::bootloader::{self, BootLoaderTarget, BootSelection};
use crate::error::{JobError, PartJobError};
use crate::hardware::FirmwareMode;
use crate::jobs::{
    CheckFileSystemJob, CreatePartitionJob, CreatePartitionTableJob, DeletePartitionJob,
    FormatPartitionJob, Job, MoveFileSystemJob, PartitionJob, ResizePartitionJob,
};
use crate::model::{
    align_up, mb_to_bytes, Device, DeviceModel, NewPartition, Partition, PartitionRef,
    PartitionTable, TableChange, TableError, MIB,
};
use crate::queue::JobQueue;
use crate::types::{BootMode, FileSystem, PartitionFlag, PartitionRole, TableKind};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while turning a plan file into jobs
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Failed to read plan file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid plan file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Plan has no jobs")]
    Empty,

    #[error("Job {index}: device {} is not known", device.display())]
    UnknownDevice { index: usize, device: PathBuf },

    #[error("Job {index}: partition {partition} does not exist at this point of the plan")]
    UnknownPartition { index: usize, partition: String },

    #[error("Job {index}: device {} has no partition table at this point of the plan", device.display())]
    NoTable { index: usize, device: PathBuf },

    #[error("Job {index}: {reason}")]
    Invalid { index: usize, reason: String },

    #[error("Job {index}: {error}")]
    Table {
        index: usize,
        #[source]
        error: TableError,
    },

    #[error("{}: {}", .0.title(), .0.details())]
    Boot(JobError),
}

impl From<PlanError> for PartJobError {
    fn from(err: PlanError) -> Self {
        PartJobError::plan(err.to_string())
    }
}

/// One entry of the plan file's `jobs` array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum PlanStep {
    CreatePartitionTable {
        device: PathBuf,
        table: TableKind,
    },
    CreatePartition {
        device: PathBuf,
        size_mb: u64,
        #[serde(default)]
        filesystem: FileSystem,
        #[serde(default)]
        role: PartitionRole,
        #[serde(default)]
        mount_point: Option<PathBuf>,
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        start_mb: Option<u64>,
        #[serde(default)]
        flags: Vec<PartitionFlag>,
    },
    DeletePartition {
        device: PathBuf,
        partition: u32,
    },
    ResizePartition {
        device: PathBuf,
        partition: u32,
        size_mb: u64,
    },
    MoveFileSystem {
        device: PathBuf,
        partition: u32,
        start_mb: u64,
        /// Logical sector size the move was planned with; defaults to the device's
        #[serde(default)]
        sector_size: Option<u64>,
    },
    FormatPartition {
        device: PathBuf,
        partition: u32,
        filesystem: FileSystem,
        #[serde(default)]
        label: Option<String>,
    },
    CheckFileSystem {
        device: PathBuf,
        partition: u32,
    },
}

/// The external job-list interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanFile {
    #[serde(default)]
    pub firmware: BootMode,
    pub boot_device: PathBuf,
    #[serde(default)]
    pub boot_selection: Option<BootSelection>,
    pub jobs: Vec<PlanStep>,
}

impl PlanFile {
    pub fn from_json(json: &str) -> Result<Self, PlanError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let content = fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }
}

/// A validated, ready-to-run plan.
#[derive(Debug, Clone)]
pub struct Plan {
    pub firmware: FirmwareMode,
    pub jobs: Vec<Job>,
    pub boot_target: BootLoaderTarget,
    /// Device model as it will look after every job succeeded
    pub planned: DeviceModel,
}

impl Plan {
    pub fn is_destructive(&self) -> bool {
        self.jobs.iter().any(|j| j.is_destructive())
    }

    /// Returns a summary of the plan for logging/display.
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Firmware: {}", self.firmware),
            format!("Boot loader: {}", self.boot_target.label(&self.planned)),
            format!("Jobs ({}):", self.jobs.len()),
        ];
        for (i, job) in self.jobs.iter().enumerate() {
            let marker = if job.is_destructive() { " [destructive]" } else { "" };
            lines.push(format!("  {}. {}{}", i + 1, job.describe().summary, marker));
        }
        lines.join("\n")
    }

    pub fn into_queue(self) -> JobQueue {
        JobQueue::new(self.jobs)
    }
}

/// Build the job list for `file` against the scanned `model`.
///
/// `firmware` is the already-resolved firmware mode; callers resolve
/// [`BootMode::Auto`] with [`BootMode::resolve`].
pub fn build_plan(
    file: &PlanFile,
    model: &DeviceModel,
    firmware: FirmwareMode,
) -> Result<Plan, PlanError> {
    if file.jobs.is_empty() {
        return Err(PlanError::Empty);
    }

    let mut planned = model.clone();
    let mut jobs = Vec::with_capacity(file.jobs.len());
    for (index, step) in file.jobs.iter().enumerate() {
        let (built, changes) = plan_job(index, step, &planned)?;
        for change in &changes {
            planned
                .apply(change)
                .map_err(|error| PlanError::Table { index, error })?;
        }
        debug!("Planned job {}: {:?}", index, built.iter().map(Job::kind).collect::<Vec<_>>());
        jobs.extend(built);
    }

    let boot_target = bootloader::resolve(
        &planned,
        firmware,
        &file.boot_device,
        file.boot_selection.as_ref(),
    )
    .map_err(PlanError::Boot)?;

    info!(
        "Plan built: {} job(s), boot loader {}",
        jobs.len(),
        boot_target
    );
    Ok(Plan {
        firmware,
        jobs,
        boot_target,
        planned,
    })
}

fn device<'m>(index: usize, model: &'m DeviceModel, path: &Path) -> Result<&'m Device, PlanError> {
    model.device(path).ok_or_else(|| PlanError::UnknownDevice {
        index,
        device: path.to_path_buf(),
    })
}

fn table<'m>(index: usize, dev: &'m Device) -> Result<&'m PartitionTable, PlanError> {
    dev.table.as_ref().ok_or_else(|| PlanError::NoTable {
        index,
        device: dev.path.clone(),
    })
}

fn partition<'m>(
    index: usize,
    dev: &'m Device,
    number: u32,
) -> Result<(PartitionRef, &'m Partition), PlanError> {
    let part = table(index, dev)?
        .find(number)
        .ok_or_else(|| PlanError::UnknownPartition {
            index,
            partition: PartitionRef::new(dev.path.clone(), number).to_string(),
        })?;
    Ok((PartitionRef::new(dev.path.clone(), number), part))
}

/// Jobs for one plan entry and the changes they are expected to commit.
fn plan_job(
    index: usize,
    step: &PlanStep,
    model: &DeviceModel,
) -> Result<(Vec<Job>, Vec<TableChange>), PlanError> {
    let invalid = |reason: String| PlanError::Invalid { index, reason };
    let table_err = |error: TableError| PlanError::Table { index, error };

    match step {
        PlanStep::CreatePartitionTable { device: path, table: kind } => {
            let dev = device(index, model, path)?;
            let table = PartitionTable::new(*kind, dev.size, dev.sector_size);
            Ok((
                vec![Job::CreatePartitionTable(CreatePartitionTableJob::new(
                    path.clone(),
                    dev.model.clone(),
                    *kind,
                ))],
                vec![TableChange::TableCreated {
                    device: path.clone(),
                    table,
                }],
            ))
        }

        PlanStep::CreatePartition {
            device: path,
            size_mb,
            filesystem,
            role,
            mount_point,
            label,
            start_mb,
            flags,
        } => {
            if *size_mb == 0 {
                return Err(invalid("partition size must be at least 1 MB".to_string()));
            }
            let dev = device(index, model, path)?;
            let mut scratch = table(index, dev)?.clone();
            let added = scratch
                .add_partition(NewPartition {
                    start: start_mb.map(mb_to_bytes),
                    size: mb_to_bytes(*size_mb),
                    fs: *filesystem,
                    role: *role,
                    label: label.clone(),
                    mount_point: mount_point.clone(),
                    flags: flags.clone(),
                })
                .map_err(table_err)?;

            // Pin the placement so the job lands exactly where it was planned
            let mut job = CreatePartitionJob::new(path.clone(), dev.model.clone(), *size_mb, *filesystem)
                .at(added.start / MIB)
                .role(*role)
                .flags(flags.clone());
            if let Some(label) = label {
                job = job.label(label.clone());
            }
            if let Some(mount_point) = mount_point {
                job = job.mount_point(mount_point.clone());
            }
            Ok((
                vec![Job::CreatePartition(job)],
                vec![TableChange::PartitionAdded {
                    device: path.clone(),
                    partition: added,
                }],
            ))
        }

        PlanStep::DeletePartition { device: path, partition: number } => {
            let dev = device(index, model, path)?;
            let (part_ref, _) = partition(index, dev, *number)?;
            Ok((
                vec![Job::DeletePartition(DeletePartitionJob::new(path.clone(), part_ref))],
                vec![TableChange::PartitionRemoved {
                    device: path.clone(),
                    number: *number,
                }],
            ))
        }

        PlanStep::ResizePartition {
            device: path,
            partition: number,
            size_mb,
        } => {
            let dev = device(index, model, path)?;
            let (part_ref, part) = partition(index, dev, *number)?;
            if !part.fs.supports_resize() {
                return Err(invalid(format!(
                    "resizing {} file systems is not supported",
                    part.fs
                )));
            }
            let end = part.start + align_up(mb_to_bytes(*size_mb), dev.sector_size);
            Ok((
                vec![Job::ResizePartition(ResizePartitionJob::new(
                    part_ref,
                    part.fs,
                    part.size_mb(),
                    *size_mb,
                ))],
                vec![TableChange::GeometryChanged {
                    device: path.clone(),
                    number: *number,
                    start: part.start,
                    end,
                }],
            ))
        }

        PlanStep::MoveFileSystem {
            device: path,
            partition: number,
            start_mb,
            sector_size,
        } => {
            let dev = device(index, model, path)?;
            let (part_ref, part) = partition(index, dev, *number)?;
            let start = mb_to_bytes(*start_mb);
            let end = start + part.size();

            let fs = part.fs;
            let mv = MoveFileSystemJob::new(
                part_ref.clone(),
                fs,
                sector_size.unwrap_or(dev.sector_size),
                *start_mb,
            );
            Ok((
                vec![
                    Job::CheckFileSystem(CheckFileSystemJob::new(part_ref, fs)),
                    Job::MoveFileSystem(mv),
                ],
                vec![TableChange::GeometryChanged {
                    device: path.clone(),
                    number: *number,
                    start,
                    end,
                }],
            ))
        }

        PlanStep::FormatPartition {
            device: path,
            partition: number,
            filesystem,
            label,
        } => {
            let dev = device(index, model, path)?;
            let (part_ref, part) = partition(index, dev, *number)?;
            if part.role == PartitionRole::Extended {
                return Err(invalid(format!("{} is an extended partition", part_ref)));
            }
            if filesystem.mkfs_command(None).is_none() {
                return Err(invalid(format!("cannot create a {} file system", filesystem)));
            }
            let mut job = FormatPartitionJob::new(part_ref, dev.model.clone(), *filesystem, part.size_mb());
            if let Some(label) = label {
                job = job.label(label.clone());
            }
            Ok((
                vec![Job::FormatPartition(job)],
                vec![TableChange::FileSystemChanged {
                    device: path.clone(),
                    number: *number,
                    fs: *filesystem,
                    label: label.clone(),
                }],
            ))
        }

        PlanStep::CheckFileSystem { device: path, partition: number } => {
            let dev = device(index, model, path)?;
            let (part_ref, part) = partition(index, dev, *number)?;
            Ok((
                vec![Job::CheckFileSystem(CheckFileSystemJob::new(part_ref, part.fs))],
                Vec::new(),
            ))
        }
    }
}
