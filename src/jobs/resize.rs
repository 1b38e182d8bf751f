use super::{commit, open_table, strong, JobContext, JobDescription, JobOutcome, PartitionJob};
use crate::error::JobError;
use crate::model::{align_up, mb_to_bytes, PartitionRef, TableChange, MIB};
use crate::types::FileSystem;
use std::path::Path;
use tracing::{error, info, warn};

/// Rewrite the table entry of `part` to `[start, end)`.
///
/// Also used by moves once the data is in place.
pub(super) fn update_geometry(
    ctx: &JobContext<'_>,
    part: &PartitionRef,
    start: u64,
    end: u64,
) -> Result<TableChange, JobError> {
    let mut dev = ctx.open(&part.device)?;
    let mut table = open_table(dev.as_mut())?;
    table.set_geometry(part.number, start, end).map_err(|e| {
        JobError::operation("Failed to change the geometry of the partition.", e.to_string())
    })?;
    commit(dev.as_mut(), &table)?;
    drop(dev);

    info!("Updated geometry of partition {} to [{}..{})", part, start, end);
    Ok(TableChange::GeometryChanged {
        device: part.device.clone(),
        number: part.number,
        start,
        end,
    })
}

/// Changes the size of a partition and its filesystem; the start stays put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizePartitionJob {
    partition: PartitionRef,
    fs: FileSystem,
    old_size_mb: u64,
    new_size_mb: u64,
}

impl ResizePartitionJob {
    pub fn new(partition: PartitionRef, fs: FileSystem, old_size_mb: u64, new_size_mb: u64) -> Self {
        Self {
            partition,
            fs,
            old_size_mb,
            new_size_mb,
        }
    }

    pub fn partition(&self) -> &PartitionRef {
        &self.partition
    }

    fn failed(&self, details: impl Into<String>) -> JobError {
        JobError::operation(
            format!(
                "The installer failed to resize partition {} on disk '{}'.",
                self.partition,
                self.partition.device.display()
            ),
            details,
        )
    }

    /// Current geometry and the geometry we are aiming for.
    fn plan_geometry(&self, ctx: &JobContext<'_>) -> Result<((u64, u64), (u64, u64)), JobError> {
        let mut dev = ctx.open(&self.partition.device)?;
        let table = open_table(dev.as_mut())?;
        drop(dev);

        let current = table
            .find(self.partition.number)
            .ok_or_else(|| self.failed(format!("Partition {} does not exist.", self.partition)))?;
        let new_end = current.start + align_up(mb_to_bytes(self.new_size_mb), table.sector_size);

        // Validate against a scratch copy so nothing is written yet
        let mut scratch = table.clone();
        scratch
            .set_geometry(self.partition.number, current.start, new_end)
            .map_err(|e| self.failed(e.to_string()))?;
        Ok(((current.start, current.end), (current.start, new_end)))
    }

    fn resize(&self, ctx: &JobContext<'_>) -> JobOutcome {
        match self.try_resize(ctx) {
            Ok(changes) => JobOutcome::success(changes),
            Err((error, changes)) => JobOutcome::partial(error, changes),
        }
    }

    fn try_resize(
        &self,
        ctx: &JobContext<'_>,
    ) -> Result<Vec<TableChange>, (JobError, Vec<TableChange>)> {
        let bare = |e: JobError| (e, Vec::new());

        if !self.fs.supports_resize() {
            return Err(bare(self.failed(format!(
                "Resizing {} file systems is not supported.",
                self.fs
            ))));
        }

        let ((start, old_end), (_, new_end)) = self.plan_geometry(ctx).map_err(bare)?;
        if new_end == old_end {
            info!("Partition {} already has the requested size", self.partition);
            return Ok(Vec::new());
        }
        let new_size = new_end - start;
        let node = self.partition.node();
        let tools = ctx.storage.tools();

        let minimum = tools
            .min_size(&node, self.fs)
            .map_err(|e| bare(e.into_job_error(|d| self.failed(d))))?;
        if let Some(min) = minimum {
            if new_size < min {
                return Err(bare(self.failed(format!(
                    "The requested size of {}MB is below the minimum size of {}MB for the file system on {}.",
                    self.new_size_mb,
                    min.div_ceil(MIB),
                    self.partition
                ))));
            }
        }

        tools.fsck(&node, self.fs).map_err(|e| {
            bare(e.into_job_error(|details| JobError::FsckFailed {
                partition: self.partition.to_string(),
                details,
            }))
        })?;

        if new_end < old_end {
            ctx.report(&format!("Shrinking file system on {}.", self.partition));
            tools
                .resize(&node, self.fs, new_size)
                .map_err(|e| bare(e.into_job_error(|d| self.failed(d))))?;
            let change = update_geometry(ctx, &self.partition, start, new_end).map_err(bare)?;
            return Ok(vec![change]);
        }

        let grown = update_geometry(ctx, &self.partition, start, new_end).map_err(bare)?;
        ctx.report(&format!("Growing file system on {}.", self.partition));
        let Err(e) = tools.resize(&node, self.fs, new_size) else {
            return Ok(vec![grown]);
        };

        warn!(
            "Growing file system on {} failed, restoring old geometry",
            self.partition
        );
        let error = e.into_job_error(|d| self.failed(d));
        match update_geometry(ctx, &self.partition, start, old_end) {
            Ok(restored) => Err((error, vec![grown, restored])),
            Err(restore) => {
                error!(
                    "Restoring geometry of {} failed: {}",
                    self.partition,
                    restore.details()
                );
                let error = self.failed(format!(
                    "{}\nRestoring the previous partition geometry failed as well: {}",
                    error.details(),
                    restore.details()
                ));
                Err((error, vec![grown]))
            }
        }
    }
}

impl PartitionJob for ResizePartitionJob {
    fn describe(&self) -> JobDescription {
        JobDescription {
            summary: format!("Resize partition {}.", self.partition),
            rich_summary: format!(
                "Resize {}MB partition {} to {}MB.",
                strong(self.old_size_mb),
                strong(&self.partition),
                strong(self.new_size_mb)
            ),
            status: format!(
                "Resizing {}MB partition {} to {}MB.",
                self.old_size_mb, self.partition, self.new_size_mb
            ),
        }
    }

    fn run(&self, ctx: &JobContext<'_>) -> JobOutcome {
        self.resize(ctx)
    }

    fn is_destructive(&self) -> bool {
        false
    }

    fn device(&self) -> &Path {
        &self.partition.device
    }
}
