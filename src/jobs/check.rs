use super::{strong, JobContext, JobDescription, JobOutcome, PartitionJob};
use crate::error::JobError;
use crate::model::PartitionRef;
use crate::types::FileSystem;
use std::path::Path;
use tracing::info;

/// Read-only consistency check, scheduled in front of every move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckFileSystemJob {
    partition: PartitionRef,
    fs: FileSystem,
}

impl CheckFileSystemJob {
    pub fn new(partition: PartitionRef, fs: FileSystem) -> Self {
        Self { partition, fs }
    }

    pub fn partition(&self) -> &PartitionRef {
        &self.partition
    }

    fn check(&self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        if self.fs.fsck_command().is_none() {
            info!(
                "No checker for {} on {}, nothing to check",
                self.fs, self.partition
            );
            return Ok(());
        }
        ctx.storage
            .tools()
            .fsck(&self.partition.node(), self.fs)
            .map_err(|e| {
                e.into_job_error(|details| JobError::FsckFailed {
                    partition: self.partition.to_string(),
                    details,
                })
            })?;
        info!("File system on {} is clean", self.partition);
        Ok(())
    }
}

impl PartitionJob for CheckFileSystemJob {
    fn describe(&self) -> JobDescription {
        JobDescription {
            summary: format!("Check file system on partition {}.", self.partition),
            rich_summary: format!("Check file system on partition {}.", strong(&self.partition)),
            status: format!("Checking file system on partition {}.", self.partition),
        }
    }

    fn run(&self, ctx: &JobContext<'_>) -> JobOutcome {
        self.check(ctx).map(|()| Vec::new()).into()
    }

    fn is_destructive(&self) -> bool {
        false
    }

    fn device(&self) -> &Path {
        &self.partition.device
    }
}
