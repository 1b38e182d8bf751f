//! Moving a filesystem to a new offset on the same device
//!
//! The copy runs chunk by chunk while the device is held exclusively, in the
//! direction that never overwrites source bytes before they were read. When
//! source and target overlap, the only copy of a clobbered source byte is the
//! one already written to the target, plus the chunk in flight, which stays in
//! memory until its write completes. A failed copy is undone by copying the
//! finished chunks back in reverse order, so the backup never exceeds one
//! chunk. Non-overlapping moves never touch the source and need no rollback.

use super::{commit, open_table, strong, JobContext, JobDescription, JobOutcome, PartitionJob};
use crate::error::JobError;
use crate::model::{mb_to_bytes, PartitionRef, PartitionTable, TableChange};
use crate::storage::{BlockDevice, StorageError};
use crate::types::FileSystem;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Offset of the BPB "hidden sectors" field in FAT and NTFS boot sectors.
const HIDDEN_SECTORS_OFFSET: usize = 0x1C;

/// FAT and NTFS boot sectors are 512 bytes whatever the device sector size.
const BOOT_SECTOR_LEN: usize = 512;

/// Byte ranges of one copy, fixed before any write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CopyPlan {
    source: u64,
    target: u64,
    len: u64,
}

impl CopyPlan {
    fn overlaps(&self) -> bool {
        self.source < self.target + self.len && self.target < self.source + self.len
    }

    /// Chunk offsets relative to the range start, in copy order.
    ///
    /// Moving towards the end of the disk copies back-to-front so a chunk is
    /// read before the copy of an earlier one can clobber it.
    fn chunks(&self, chunk: u64) -> Vec<(u64, usize)> {
        let mut offsets: Vec<(u64, usize)> = (0..self.len.div_ceil(chunk))
            .map(|i| {
                let off = i * chunk;
                (off, chunk.min(self.len - off) as usize)
            })
            .collect();
        if self.target > self.source {
            offsets.reverse();
        }
        offsets
    }
}

/// How far a copy got; enough to undo it.
#[derive(Debug, Default)]
struct CopyProgress {
    /// Chunks fully written to the target, in copy order
    done: Vec<(u64, usize)>,
    /// Chunk whose write failed midway, with its original source bytes
    torn: Option<(u64, Vec<u8>)>,
}

impl CopyProgress {
    /// Bytes held in memory for the rollback
    fn backup_len(&self) -> usize {
        self.torn.as_ref().map_or(0, |(_, data)| data.len())
    }

    /// Restore the source range of `plan`.
    ///
    /// Every source byte a finished chunk clobbered was read before it was
    /// overwritten and sits at the matching target offset. Copying finished
    /// chunks back newest first reads each target chunk before the copy-back
    /// of an older one can overwrite it.
    fn roll_back(&self, dev: &mut dyn BlockDevice, plan: CopyPlan) -> Result<(), StorageError> {
        if let Some((off, data)) = &self.torn {
            dev.write_at(plan.source + off, data)?;
        }
        let mut buf = Vec::new();
        for &(off, len) in self.done.iter().rev() {
            buf.resize(len, 0);
            dev.read_at(plan.target + off, &mut buf)?;
            dev.write_at(plan.source + off, &buf)?;
        }
        dev.sync()
    }
}

/// Moves a partition's data and table entry to a new start offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveFileSystemJob {
    partition: PartitionRef,
    fs: FileSystem,
    /// Logical sector size the move was planned with
    sector_size: u64,
    new_start_mb: u64,
}

impl MoveFileSystemJob {
    pub fn new(partition: PartitionRef, fs: FileSystem, sector_size: u64, new_start_mb: u64) -> Self {
        Self {
            partition,
            fs,
            sector_size,
            new_start_mb,
        }
    }

    pub fn partition(&self) -> &PartitionRef {
        &self.partition
    }

    pub fn file_system(&self) -> FileSystem {
        self.fs
    }

    fn rolled_back(&self, cause: &StorageError) -> JobError {
        JobError::operation(
            format!(
                "Moving of partition {} failed, changes have been rolled back.",
                self.partition
            ),
            cause.to_string(),
        )
    }

    fn copy(
        &self,
        ctx: &JobContext<'_>,
        dev: &mut dyn BlockDevice,
        plan: CopyPlan,
        chunk: u64,
        progress: &mut CopyProgress,
    ) -> Result<(), StorageError> {
        let chunks = plan.chunks(chunk);
        let total = chunks.len();
        let mut buf = vec![0u8; chunk as usize];
        let mut last_percent = 0;

        for (i, (off, len)) in chunks.into_iter().enumerate() {
            dev.read_at(plan.source + off, &mut buf[..len])?;
            if let Err(e) = dev.write_at(plan.target + off, &buf[..len]) {
                progress.torn = Some((off, buf[..len].to_vec()));
                return Err(e);
            }
            progress.done.push((off, len));

            let percent = (i + 1) * 100 / total;
            if percent / 10 > last_percent / 10 {
                last_percent = percent;
                ctx.report(&format!(
                    "Moving file system of partition {}: {}%",
                    self.partition, percent
                ));
            }
        }
        dev.sync()?;
        Ok(())
    }

    /// Undo a failed overlapping copy, or explain why nothing needs undoing.
    fn recover(
        &self,
        dev: &mut dyn BlockDevice,
        plan: CopyPlan,
        progress: &CopyProgress,
        cause: StorageError,
    ) -> JobError {
        if !plan.overlaps() {
            return JobError::operation(
                format!("Moving of partition {} failed.", self.partition),
                format!(
                    "{}\nSource and target for copying do not overlap: Rollback is not required.",
                    cause
                ),
            );
        }

        warn!(
            "Copy for {} failed ({}), rolling back {} chunk(s) with {} bytes kept in memory",
            self.partition,
            cause,
            progress.done.len() + usize::from(progress.torn.is_some()),
            progress.backup_len()
        );
        match progress.roll_back(dev, plan) {
            Ok(()) => {
                info!("Rollback of {} completed", self.partition);
                self.rolled_back(&cause)
            }
            Err(rollback) => {
                error!("Rollback of {} failed: {}", self.partition, rollback);
                JobError::RollbackFailed {
                    partition: self.partition.to_string(),
                    details: format!(
                        "Copying failed: {}\nRoll back failed: {}",
                        cause, rollback
                    ),
                }
            }
        }
    }

    /// Write the new start sector into the filesystem's own boot sector.
    fn update_boot_sector(&self, dev: &mut dyn BlockDevice, start: u64, end: u64) -> Result<(), String> {
        let sector_size = dev.logical_sector_size();
        let hidden = u32::try_from(start / sector_size)
            .map_err(|_| format!("Start sector {} does not fit the boot sector.", start / sector_size))?;

        let mut sectors = vec![start];
        // NTFS keeps a backup boot sector in the last sector of the volume
        if self.fs == FileSystem::Ntfs {
            sectors.push(end - sector_size);
        }

        let mut buf = [0u8; BOOT_SECTOR_LEN];
        for offset in sectors {
            dev.read_at(offset, &mut buf).map_err(|e| e.to_string())?;
            if buf[510] != 0x55 || buf[511] != 0xAA {
                return Err(format!("No boot sector signature at offset {}.", offset));
            }
            buf[HIDDEN_SECTORS_OFFSET..HIDDEN_SECTORS_OFFSET + 4].copy_from_slice(&hidden.to_le_bytes());
            dev.write_at(offset, &buf).map_err(|e| e.to_string())?;
        }
        dev.sync().map_err(|e| e.to_string())
    }

    fn run_move(&self, ctx: &JobContext<'_>) -> JobOutcome {
        let mut dev = match ctx.open(&self.partition.device) {
            Ok(dev) => dev,
            Err(e) => return JobOutcome::failure(e),
        };
        let actual = dev.logical_sector_size();
        if actual != self.sector_size {
            return JobOutcome::failure(JobError::UnsupportedSectorSizeMismatch {
                planned: self.sector_size,
                actual,
            });
        }
        let mut table = match open_table(dev.as_mut()) {
            Ok(t) => t,
            Err(e) => return JobOutcome::failure(e),
        };

        let plan = match self.plan(&table) {
            Ok(plan) => plan,
            Err(e) => return JobOutcome::failure(e),
        };
        if plan.source == plan.target {
            info!("Partition {} already starts at the target offset", self.partition);
            return JobOutcome::success(Vec::new());
        }
        if plan.source + plan.len > dev.size() {
            return JobOutcome::failure(JobError::operation(
                format!(
                    "Could not open file system on partition {} for moving.",
                    self.partition
                ),
                "The partition extends beyond the end of the device.",
            ));
        }

        let chunk = ctx.config.copy_chunk_size;
        if chunk == 0 || chunk % actual != 0 {
            return JobOutcome::failure(JobError::operation(
                format!(
                    "Could not create target for moving file system on partition {}.",
                    self.partition
                ),
                format!(
                    "Copy chunk size {} is not a multiple of the {}-byte sector size.",
                    chunk, actual
                ),
            ));
        }

        debug!(
            "Moving {} bytes of {} from {} to {} (overlap: {})",
            plan.len,
            self.partition,
            plan.source,
            plan.target,
            plan.overlaps()
        );
        let mut progress = CopyProgress::default();
        if let Err(cause) = self.copy(ctx, dev.as_mut(), plan, chunk, &mut progress) {
            return JobOutcome::failure(self.recover(dev.as_mut(), plan, &progress, cause));
        }

        let new_end = plan.target + plan.len;
        let committed = table
            .set_geometry(self.partition.number, plan.target, new_end)
            .map_err(|e| StorageError::Table {
                device: self.partition.device.display().to_string(),
                details: e.to_string(),
            })
            .and_then(|()| {
                commit(dev.as_mut(), &table).map_err(|e| StorageError::Table {
                    device: self.partition.device.display().to_string(),
                    details: e.details(),
                })
            });
        if let Err(e) = committed {
            // Data is at the target but the table still points at the source
            return JobOutcome::failure(self.recover(dev.as_mut(), plan, &progress, e));
        }

        let changes = vec![TableChange::GeometryChanged {
            device: self.partition.device.clone(),
            number: self.partition.number,
            start: plan.target,
            end: new_end,
        }];
        info!(
            "Moved file system of {} to offset {}",
            self.partition, plan.target
        );

        if self.fs.has_boot_sector() {
            if let Err(details) = self.update_boot_sector(dev.as_mut(), plan.target, new_end) {
                return JobOutcome::partial(
                    JobError::operation(
                        format!(
                            "Updating boot sector after the moving of partition {} failed.",
                            self.partition
                        ),
                        details,
                    ),
                    changes,
                );
            }
        }
        drop(dev);
        JobOutcome::success(changes)
    }

    fn plan(&self, table: &PartitionTable) -> Result<CopyPlan, JobError> {
        let part = table.find(self.partition.number).ok_or_else(|| {
            JobError::operation(
                format!(
                    "Could not open file system on partition {} for moving.",
                    self.partition
                ),
                format!("Partition {} does not exist.", self.partition),
            )
        })?;
        let target = mb_to_bytes(self.new_start_mb);
        let mut scratch = table.clone();
        scratch
            .set_geometry(self.partition.number, target, target + part.size())
            .map_err(|e| {
                JobError::operation(
                    format!(
                        "Could not create target for moving file system on partition {}.",
                        self.partition
                    ),
                    e.to_string(),
                )
            })?;
        Ok(CopyPlan {
            source: part.start,
            target,
            len: part.size(),
        })
    }
}

impl PartitionJob for MoveFileSystemJob {
    fn describe(&self) -> JobDescription {
        JobDescription {
            summary: format!("Move file system of partition {}.", self.partition),
            rich_summary: format!(
                "Move file system of partition {} to {}MB.",
                strong(&self.partition),
                strong(self.new_start_mb)
            ),
            status: format!("Moving file system of partition {}.", self.partition),
        }
    }

    fn run(&self, ctx: &JobContext<'_>) -> JobOutcome {
        self.run_move(ctx)
    }

    fn is_destructive(&self) -> bool {
        false
    }

    fn device(&self) -> &Path {
        &self.partition.device
    }
}
