use super::{disk_name, strong, JobContext, JobDescription, JobOutcome, PartitionJob};
use crate::error::JobError;
use crate::model::{PartitionTable, TableChange};
use crate::types::TableKind;
use std::path::{Path, PathBuf};
use tracing::info;

/// Writes a fresh, empty partition table, destroying the existing one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePartitionTableJob {
    device: PathBuf,
    model: String,
    kind: TableKind,
}

impl CreatePartitionTableJob {
    pub fn new(device: impl Into<PathBuf>, model: impl Into<String>, kind: TableKind) -> Self {
        Self {
            device: device.into(),
            model: model.into(),
            kind,
        }
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    fn create(&self, ctx: &JobContext<'_>) -> Result<Vec<TableChange>, JobError> {
        let failed = |details: String| JobError::TableCreate {
            device: self.device.display().to_string(),
            details,
        };

        let mut dev = ctx.storage.open(&self.device).map_err(|e| failed(e.to_string()))?;
        let table = PartitionTable::new(self.kind, dev.size(), dev.logical_sector_size());
        dev.write_table(&table)
            .and_then(|()| dev.sync())
            .map_err(|e| failed(e.to_string()))?;
        drop(dev);

        info!(
            "Created {} partition table on {}",
            self.kind,
            self.device.display()
        );
        Ok(vec![TableChange::TableCreated {
            device: self.device.clone(),
            table,
        }])
    }
}

impl PartitionJob for CreatePartitionTableJob {
    fn describe(&self) -> JobDescription {
        let disk = disk_name(&self.device, &self.model);
        JobDescription {
            summary: format!("Create new {} partition table on {}.", self.kind, disk),
            rich_summary: format!(
                "Create new {} partition table on {}.",
                strong(self.kind),
                strong(&disk)
            ),
            status: format!(
                "Creating new {} partition table on {}.",
                self.kind,
                self.device.display()
            ),
        }
    }

    fn run(&self, ctx: &JobContext<'_>) -> JobOutcome {
        self.create(ctx).into()
    }

    fn is_destructive(&self) -> bool {
        true
    }

    fn device(&self) -> &Path {
        &self.device
    }
}
