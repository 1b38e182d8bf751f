use super::{commit, disk_name, open_table, strong, JobContext, JobDescription, JobOutcome, PartitionJob};
use crate::error::JobError;
use crate::model::{mb_to_bytes, partition_path, NewPartition, TableChange};
use crate::types::{FileSystem, PartitionFlag, PartitionRole};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Allocates a new partition in free space and formats it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePartitionJob {
    device: PathBuf,
    model: String,
    size_mb: u64,
    start_mb: Option<u64>,
    fs: FileSystem,
    role: PartitionRole,
    label: Option<String>,
    mount_point: Option<PathBuf>,
    flags: Vec<PartitionFlag>,
}

impl CreatePartitionJob {
    pub fn new(
        device: impl Into<PathBuf>,
        model: impl Into<String>,
        size_mb: u64,
        fs: FileSystem,
    ) -> Self {
        Self {
            device: device.into(),
            model: model.into(),
            size_mb,
            start_mb: None,
            fs,
            role: PartitionRole::Primary,
            label: None,
            mount_point: None,
            flags: Vec::new(),
        }
    }

    /// Place at an explicit offset instead of the first fitting free range.
    pub fn at(mut self, start_mb: u64) -> Self {
        self.start_mb = Some(start_mb);
        self
    }

    pub fn role(mut self, role: PartitionRole) -> Self {
        self.role = role;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn mount_point(mut self, mount_point: impl Into<PathBuf>) -> Self {
        self.mount_point = Some(mount_point.into());
        self
    }

    pub fn flags(mut self, flags: Vec<PartitionFlag>) -> Self {
        self.flags = flags;
        self
    }

    pub fn size_mb(&self) -> u64 {
        self.size_mb
    }

    pub fn file_system(&self) -> FileSystem {
        self.fs
    }

    pub fn partition_flags(&self) -> &[PartitionFlag] {
        &self.flags
    }

    fn needs_format(&self) -> bool {
        self.role != PartitionRole::Extended && self.fs.mkfs_command(None).is_some()
    }

    fn request(&self) -> NewPartition {
        NewPartition {
            start: self.start_mb.map(mb_to_bytes),
            size: mb_to_bytes(self.size_mb),
            fs: self.fs,
            role: self.role,
            label: self.label.clone(),
            mount_point: self.mount_point.clone(),
            flags: self.flags.clone(),
        }
    }

    fn create(&self, ctx: &JobContext<'_>) -> JobOutcome {
        let mut dev = match ctx.open(&self.device) {
            Ok(dev) => dev,
            Err(e) => return JobOutcome::failure(e),
        };
        let mut table = match open_table(dev.as_mut()) {
            Ok(t) => t,
            Err(e) => return JobOutcome::failure(e),
        };

        let mut partition = match table.add_partition(self.request()) {
            Ok(p) => p,
            Err(e) => {
                return JobOutcome::failure(JobError::operation(
                    format!(
                        "The installer failed to create partition on disk '{}'.",
                        self.device.display()
                    ),
                    e.to_string(),
                ));
            }
        };
        if let Err(e) = commit(dev.as_mut(), &table) {
            return JobOutcome::failure(e);
        }
        drop(dev);

        let node = partition_path(&self.device, partition.number);
        info!(
            "Created partition {} ({} MB, {})",
            node.display(),
            self.size_mb,
            self.role
        );

        // The entry exists now; its filesystem does not until mkfs succeeds
        partition.fs = FileSystem::Unformatted;
        let mut changes = vec![TableChange::PartitionAdded {
            device: self.device.clone(),
            partition: partition.clone(),
        }];
        if !self.needs_format() {
            return JobOutcome::success(changes);
        }

        ctx.report(&format!(
            "Formatting partition {} with file system {}.",
            node.display(),
            self.fs
        ));
        if let Err(e) = ctx
            .storage
            .tools()
            .mkfs(&node, self.fs, self.label.as_deref())
        {
            warn!("mkfs on {} failed: {}", node.display(), e);
            let err = e.into_job_error(|details| JobError::FormatFailed {
                partition: node.display().to_string(),
                details,
            });
            return JobOutcome::partial(err, changes);
        }

        changes.push(TableChange::FileSystemChanged {
            device: self.device.clone(),
            number: partition.number,
            fs: self.fs,
            label: self.label.clone(),
        });
        JobOutcome::success(changes)
    }
}

impl PartitionJob for CreatePartitionJob {
    fn describe(&self) -> JobDescription {
        let disk = disk_name(&self.device, &self.model);
        JobDescription {
            summary: format!(
                "Create new {}MB partition on {} with file system {}.",
                self.size_mb, disk, self.fs
            ),
            rich_summary: format!(
                "Create new {}MB partition on {} with file system {}.",
                strong(self.size_mb),
                strong(&disk),
                strong(self.fs)
            ),
            status: format!(
                "Creating new {} partition on {}.",
                self.fs,
                self.device.display()
            ),
        }
    }

    fn run(&self, ctx: &JobContext<'_>) -> JobOutcome {
        self.create(ctx)
    }

    fn is_destructive(&self) -> bool {
        false
    }

    fn device(&self) -> &Path {
        &self.device
    }
}
