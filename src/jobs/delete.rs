use super::{commit, open_table, strong, JobContext, JobDescription, JobOutcome, PartitionJob};
use crate::error::JobError;
use crate::model::{PartitionRef, TableChange};
use std::path::{Path, PathBuf};
use tracing::info;

/// Removes one entry from a partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePartitionJob {
    device: PathBuf,
    partition: PartitionRef,
}

impl DeletePartitionJob {
    /// `device` is the disk whose table is edited; it must own `partition`.
    pub fn new(device: impl Into<PathBuf>, partition: PartitionRef) -> Self {
        Self {
            device: device.into(),
            partition,
        }
    }

    pub fn partition(&self) -> &PartitionRef {
        &self.partition
    }

    fn delete(&self, ctx: &JobContext<'_>) -> Result<Vec<TableChange>, JobError> {
        if self.partition.device != self.device {
            return Err(JobError::operation(
                format!("The installer failed to delete partition {}.", self.partition),
                format!(
                    "Partition ({}) and device ({}) do not match.",
                    self.partition,
                    self.device.display()
                ),
            ));
        }

        let mut dev = ctx.open(&self.device)?;
        let mut table = open_table(dev.as_mut())?;
        table.remove_partition(self.partition.number).map_err(|e| {
            JobError::operation(
                format!("The installer failed to delete partition {}.", self.partition),
                e.to_string(),
            )
        })?;
        commit(dev.as_mut(), &table)?;
        drop(dev);

        info!("Deleted partition {}", self.partition);
        Ok(vec![TableChange::PartitionRemoved {
            device: self.device.clone(),
            number: self.partition.number,
        }])
    }
}

impl PartitionJob for DeletePartitionJob {
    fn describe(&self) -> JobDescription {
        JobDescription {
            summary: format!("Delete partition {}.", self.partition),
            rich_summary: format!("Delete partition {}.", strong(&self.partition)),
            status: format!("Deleting partition {}.", self.partition),
        }
    }

    fn run(&self, ctx: &JobContext<'_>) -> JobOutcome {
        self.delete(ctx).into()
    }

    fn is_destructive(&self) -> bool {
        true
    }

    fn device(&self) -> &Path {
        &self.device
    }
}
