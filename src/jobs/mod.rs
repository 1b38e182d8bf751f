//! Partition mutation jobs
//!
//! A [`Job`] is a single described, executable unit of change against one
//! device. Every job follows the same side-effect order:
//!
//! 1. open the device exclusively
//! 2. open and validate its partition table
//! 3. perform the structural change
//! 4. commit and flush the table
//! 5. release the device
//!
//! Failures during 1–2 are non-destructive (`DeviceOpen` / `TableOpen`).
//! Failures during 3–4 are `OperationFailed` and name disk and partition.
//! Filesystem tools run only after step 5, because they claim the partition
//! node themselves.

mod check;
mod create;
mod delete;
mod format;
mod move_fs;
mod partition_table;
mod resize;

pub use check::CheckFileSystemJob;
pub use create::CreatePartitionJob;
pub use delete::DeletePartitionJob;
pub use format::FormatPartitionJob;
pub use move_fs::MoveFileSystemJob;
pub use partition_table::CreatePartitionTableJob;
pub use resize::ResizePartitionJob;

use crate::config::RunConfig;
use crate::error::JobError;
use crate::model::{PartitionTable, TableChange};
use crate::storage::{BlockDevice, Storage};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, warn};

/// Human-readable texts of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobDescription {
    /// One-line summary shown in the plan review
    pub summary: String,
    /// Same summary with the key values emphasised
    pub rich_summary: String,
    /// Shown while the job runs
    pub status: String,
}

/// Result of running one job, plus every mutation it committed.
///
/// `changes` is meaningful on failure too: a job that committed a table
/// entry and then failed to format it reports the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub result: Result<(), JobError>,
    pub changes: Vec<TableChange>,
}

impl JobOutcome {
    pub fn success(changes: Vec<TableChange>) -> Self {
        Self {
            result: Ok(()),
            changes,
        }
    }

    pub fn failure(error: JobError) -> Self {
        Self {
            result: Err(error),
            changes: Vec::new(),
        }
    }

    pub fn partial(error: JobError, changes: Vec<TableChange>) -> Self {
        Self {
            result: Err(error),
            changes,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

impl From<Result<Vec<TableChange>, JobError>> for JobOutcome {
    fn from(result: Result<Vec<TableChange>, JobError>) -> Self {
        match result {
            Ok(changes) => Self::success(changes),
            Err(error) => Self::failure(error),
        }
    }
}

/// Everything a running job may touch.
pub struct JobContext<'a> {
    pub storage: &'a dyn Storage,
    pub config: &'a RunConfig,
    status: Option<&'a dyn Fn(&str)>,
}

impl<'a> JobContext<'a> {
    pub fn new(storage: &'a dyn Storage, config: &'a RunConfig) -> Self {
        Self {
            storage,
            config,
            status: None,
        }
    }

    /// Forward intermediate status lines (copy progress) to `status`.
    pub fn with_status(mut self, status: &'a dyn Fn(&str)) -> Self {
        self.status = Some(status);
        self
    }

    pub fn report(&self, message: &str) {
        debug!("{}", message);
        if let Some(status) = self.status {
            status(message);
        }
    }

    /// Step 1: exclusive open.
    pub(crate) fn open(&self, device: &Path) -> Result<Box<dyn BlockDevice>, JobError> {
        self.storage.open(device).map_err(|e| {
            warn!("Opening {} failed: {}", device.display(), e);
            JobError::DeviceOpen {
                device: device.display().to_string(),
                details: e.to_string(),
            }
        })
    }
}

/// Step 2: the table must exist and be readable.
pub(crate) fn open_table(dev: &mut dyn BlockDevice) -> Result<PartitionTable, JobError> {
    let device = dev.path().display().to_string();
    match dev.read_table() {
        Ok(Some(table)) => Ok(table),
        Ok(None) => Err(JobError::TableOpen {
            device,
            details: "The device has no partition table.".to_string(),
        }),
        Err(e) => Err(JobError::TableOpen {
            device,
            details: e.to_string(),
        }),
    }
}

/// Step 4: write the table back and flush it.
pub(crate) fn commit(dev: &mut dyn BlockDevice, table: &PartitionTable) -> Result<(), JobError> {
    let device = dev.path().display().to_string();
    dev.write_table(table)
        .and_then(|()| dev.sync())
        .map_err(|e| {
            JobError::operation(
                format!(
                    "The installer failed to update partition table on disk '{}'.",
                    device
                ),
                e.to_string(),
            )
        })
}

/// Common contract of every job kind.
pub trait PartitionJob {
    fn describe(&self) -> JobDescription;

    /// Run once. Never retried.
    fn run(&self, ctx: &JobContext<'_>) -> JobOutcome;

    /// Whether running the job destroys data the operator may still want
    fn is_destructive(&self) -> bool;

    /// Whole-disk device the job is confined to
    fn device(&self) -> &Path;
}

/// Closed set of job kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    CreatePartitionTable(CreatePartitionTableJob),
    CreatePartition(CreatePartitionJob),
    DeletePartition(DeletePartitionJob),
    ResizePartition(ResizePartitionJob),
    MoveFileSystem(MoveFileSystemJob),
    FormatPartition(FormatPartitionJob),
    CheckFileSystem(CheckFileSystemJob),
}

impl Job {
    fn inner(&self) -> &dyn PartitionJob {
        match self {
            Self::CreatePartitionTable(j) => j,
            Self::CreatePartition(j) => j,
            Self::DeletePartition(j) => j,
            Self::ResizePartition(j) => j,
            Self::MoveFileSystem(j) => j,
            Self::FormatPartition(j) => j,
            Self::CheckFileSystem(j) => j,
        }
    }

    /// Stable machine-readable kind name, as used in plan files.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreatePartitionTable(_) => "create_partition_table",
            Self::CreatePartition(_) => "create_partition",
            Self::DeletePartition(_) => "delete_partition",
            Self::ResizePartition(_) => "resize_partition",
            Self::MoveFileSystem(_) => "move_file_system",
            Self::FormatPartition(_) => "format_partition",
            Self::CheckFileSystem(_) => "check_file_system",
        }
    }
}

impl PartitionJob for Job {
    fn describe(&self) -> JobDescription {
        self.inner().describe()
    }

    fn run(&self, ctx: &JobContext<'_>) -> JobOutcome {
        self.inner().run(ctx)
    }

    fn is_destructive(&self) -> bool {
        self.inner().is_destructive()
    }

    fn device(&self) -> &Path {
        self.inner().device()
    }
}

/// `<strong>` wrapper used by rich summaries.
fn strong(text: impl std::fmt::Display) -> String {
    format!("<strong>{}</strong>", text)
}

/// Disk reference as shown to the operator, with the model name when known.
pub(crate) fn disk_name(device: &Path, model: &str) -> String {
    if model.is_empty() {
        device.display().to_string()
    } else {
        format!("{} ({})", device.display(), model)
    }
}
