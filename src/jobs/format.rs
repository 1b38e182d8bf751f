use super::{commit, disk_name, open_table, strong, JobContext, JobDescription, JobOutcome, PartitionJob};
use crate::error::JobError;
use crate::model::{PartitionRef, TableChange};
use crate::types::FileSystem;
use std::path::Path;
use tracing::{info, warn};

/// Creates a new filesystem on an existing partition. Irreversible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatPartitionJob {
    partition: PartitionRef,
    model: String,
    fs: FileSystem,
    label: Option<String>,
    size_mb: u64,
}

impl FormatPartitionJob {
    pub fn new(
        partition: PartitionRef,
        model: impl Into<String>,
        fs: FileSystem,
        size_mb: u64,
    ) -> Self {
        Self {
            partition,
            model: model.into(),
            fs,
            label: None,
            size_mb,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn partition(&self) -> &PartitionRef {
        &self.partition
    }

    pub fn file_system(&self) -> FileSystem {
        self.fs
    }

    fn failed(&self, details: impl Into<String>) -> JobError {
        JobError::operation(
            format!(
                "The installer failed to format partition {} on disk '{}'.",
                self.partition,
                self.partition.device.display()
            ),
            details,
        )
    }

    /// Steps 1–2 only: the partition must exist before mkfs touches it.
    fn check_target(&self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        let mut dev = ctx.open(&self.partition.device)?;
        let table = open_table(dev.as_mut())?;
        if table.find(self.partition.number).is_none() {
            return Err(self.failed(format!("Partition {} does not exist.", self.partition)));
        }
        Ok(())
    }

    fn format(&self, ctx: &JobContext<'_>) -> Result<Vec<TableChange>, JobError> {
        if self.fs.mkfs_command(None).is_none() {
            return Err(self.failed(format!("Cannot create a {} file system.", self.fs)));
        }
        self.check_target(ctx)?;

        let node = self.partition.node();
        ctx.storage
            .tools()
            .mkfs(&node, self.fs, self.label.as_deref())
            .map_err(|e| {
                warn!("mkfs on {} failed: {}", node.display(), e);
                e.into_job_error(|details| JobError::FormatFailed {
                    partition: self.partition.to_string(),
                    details,
                })
            })?;
        info!("Formatted {} as {}", node.display(), self.fs);

        // Record the new type so the entry's type code matches its contents
        let mut dev = ctx.open(&self.partition.device)?;
        let mut table = open_table(dev.as_mut())?;
        table
            .set_filesystem(self.partition.number, self.fs, self.label.clone())
            .map_err(|e| self.failed(e.to_string()))?;
        commit(dev.as_mut(), &table)?;
        drop(dev);

        Ok(vec![TableChange::FileSystemChanged {
            device: self.partition.device.clone(),
            number: self.partition.number,
            fs: self.fs,
            label: self.label.clone(),
        }])
    }
}

impl PartitionJob for FormatPartitionJob {
    fn describe(&self) -> JobDescription {
        let disk = disk_name(&self.partition.device, &self.model);
        JobDescription {
            summary: format!(
                "Format partition {} (file system: {}, size: {} MB) on {}.",
                self.partition, self.fs, self.size_mb, disk
            ),
            rich_summary: format!(
                "Format {}MB partition {} with file system {}.",
                strong(self.size_mb),
                strong(&self.partition),
                strong(self.fs)
            ),
            status: format!(
                "Formatting partition {} with file system {}.",
                self.partition, self.fs
            ),
        }
    }

    fn run(&self, ctx: &JobContext<'_>) -> JobOutcome {
        self.format(ctx).into()
    }

    fn is_destructive(&self) -> bool {
        true
    }

    fn device(&self) -> &Path {
        &self.partition.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::CommandError;
    use crate::config::RunConfig;
    use crate::model::{mb_to_bytes, NewPartition, PartitionTable};
    use crate::storage::{MemoryStorage, ToolOp};
    use crate::types::{PartitionRole, TableKind};

    fn setup() -> MemoryStorage {
        let storage = MemoryStorage::new();
        storage.add_disk("/dev/vda", mb_to_bytes(500), 512);
        let mut table = PartitionTable::new(TableKind::Gpt, mb_to_bytes(500), 512);
        table
            .add_partition(NewPartition {
                start: None,
                size: mb_to_bytes(100),
                fs: FileSystem::Ext4,
                role: PartitionRole::Primary,
                label: None,
                mount_point: None,
                flags: Vec::new(),
            })
            .unwrap();
        storage.set_table(Path::new("/dev/vda"), Some(table));
        storage
    }

    #[test]
    fn test_format_records_filesystem() {
        let storage = setup();
        let config = RunConfig::default();
        let job = FormatPartitionJob::new(PartitionRef::new("/dev/vda", 1), "", FileSystem::Btrfs, 100)
            .label("data");
        let outcome = job.run(&JobContext::new(&storage, &config));
        assert!(outcome.is_success(), "{:?}", outcome.result);
        let p = storage.table(Path::new("/dev/vda")).unwrap().find(1).unwrap().clone();
        assert_eq!(p.fs, FileSystem::Btrfs);
        assert_eq!(p.label.as_deref(), Some("data"));
        assert!(job.is_destructive());
    }

    #[test]
    fn test_tool_error_is_format_failed() {
        let storage = setup();
        storage.fail_tool(
            ToolOp::Mkfs,
            CommandError::ExitCode {
                command: "mkfs.btrfs".into(),
                code: 1,
                output: "device busy".into(),
            },
        );
        let config = RunConfig::default();
        let outcome = FormatPartitionJob::new(PartitionRef::new("/dev/vda", 1), "", FileSystem::Btrfs, 100)
            .run(&JobContext::new(&storage, &config));
        match outcome.result {
            Err(JobError::FormatFailed { partition, details }) => {
                assert_eq!(partition, "/dev/vda1");
                assert!(details.contains("device busy"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            storage.table(Path::new("/dev/vda")).unwrap().find(1).unwrap().fs,
            FileSystem::Ext4
        );
    }

    #[test]
    fn test_missing_partition_never_runs_mkfs() {
        let storage = setup();
        let config = RunConfig::default();
        let outcome = FormatPartitionJob::new(PartitionRef::new("/dev/vda", 4), "", FileSystem::Ext4, 10)
            .run(&JobContext::new(&storage, &config));
        assert!(matches!(outcome.result, Err(JobError::OperationFailed { .. })));
        assert!(storage.tool_log().is_empty());
    }

    #[test]
    fn test_describe() {
        let d = FormatPartitionJob::new(PartitionRef::new("/dev/vda", 1), "Virtio", FileSystem::Ext4, 100)
            .describe();
        assert_eq!(
            d.summary,
            "Format partition /dev/vda1 (file system: ext4, size: 100 MB) on /dev/vda (Virtio)."
        );
        assert_eq!(d.status, "Formatting partition /dev/vda1 with file system ext4.");
    }
}
