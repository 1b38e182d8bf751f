//! Error handling module for partjob
//!
//! Provides the typed failure taxonomy of partition jobs plus the crate-level
//! error used by configuration, scanning and the queue plumbing.

use thiserror::Error;

/// Failure of a single job, as surfaced to the queue and the operator.
///
/// The `Display` output is the one-line title; `details()` carries the long
/// message including any captured tool output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// The device could not be opened exclusively. Nothing was written.
    #[error("Could not open device '{device}'.")]
    DeviceOpen { device: String, details: String },

    /// The device opened but its partition table could not be read. Nothing was written.
    #[error("Could not open partition table on '{device}'.")]
    TableOpen { device: String, details: String },

    /// Writing a fresh partition table failed
    #[error("The installer failed to create a partition table on {device}.")]
    TableCreate { device: String, details: String },

    /// A structural write failed. Titles always name the disk and partition.
    #[error("{title}")]
    OperationFailed { title: String, details: String },

    /// Plan and device disagree on the logical sector size
    #[error(
        "The logical sector sizes in the source and target for copying are not the same. \
         This is currently unsupported."
    )]
    UnsupportedSectorSizeMismatch { planned: u64, actual: u64 },

    /// Rollback of a partially copied move did not complete. Disk state is unknown.
    #[error("Moving of partition {partition} failed. Roll back of the changes have failed.")]
    RollbackFailed { partition: String, details: String },

    /// Filesystem creation tool reported an error
    #[error("The installer failed to create file system on partition {partition}.")]
    FormatFailed { partition: String, details: String },

    /// Filesystem check tool reported corruption
    #[error("The file system check on partition {partition} failed.")]
    FsckFailed { partition: String, details: String },

    /// An external tool exceeded its time budget and was killed
    #[error("Command {command} failed to finish in {seconds}s.")]
    CommandTimeout {
        command: String,
        seconds: u64,
        output: String,
    },

    /// EFI boot was requested but no EFI System Partition exists
    #[error("No EFI system partition configured")]
    BootTargetUnavailable { details: String },
}

impl JobError {
    /// Short operator-facing title.
    pub fn title(&self) -> String {
        self.to_string()
    }

    /// Detailed message, possibly including captured tool output.
    pub fn details(&self) -> String {
        match self {
            Self::DeviceOpen { details, .. }
            | Self::TableOpen { details, .. }
            | Self::TableCreate { details, .. }
            | Self::OperationFailed { details, .. }
            | Self::RollbackFailed { details, .. }
            | Self::FormatFailed { details, .. }
            | Self::FsckFailed { details, .. }
            | Self::BootTargetUnavailable { details } => details.clone(),
            Self::UnsupportedSectorSizeMismatch { planned, actual } => format!(
                "Planned logical sector size is {} bytes, device reports {} bytes.",
                planned, actual
            ),
            Self::CommandTimeout { output, .. } => output.clone(),
        }
    }

    /// Returns true if storage integrity can no longer be assumed.
    ///
    /// The installer must not proceed past a fatal failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RollbackFailed { .. })
    }

    /// Returns true if the failure happened after storage may have been written.
    pub fn is_destructive_risk(&self) -> bool {
        matches!(
            self,
            Self::OperationFailed { .. }
                | Self::RollbackFailed { .. }
                | Self::FormatFailed { .. }
                | Self::TableCreate { .. }
        )
    }

    /// Stable machine-readable name of the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeviceOpen { .. } => "device_open",
            Self::TableOpen { .. } => "table_open",
            Self::TableCreate { .. } => "table_create",
            Self::OperationFailed { .. } => "operation_failed",
            Self::UnsupportedSectorSizeMismatch { .. } => "unsupported_sector_size_mismatch",
            Self::RollbackFailed { .. } => "rollback_failed",
            Self::FormatFailed { .. } => "format_failed",
            Self::FsckFailed { .. } => "fsck_failed",
            Self::CommandTimeout { .. } => "command_timeout",
            Self::BootTargetUnavailable { .. } => "boot_target_unavailable",
        }
    }

    /// Create an operation failure
    pub fn operation(title: impl Into<String>, details: impl Into<String>) -> Self {
        Self::OperationFailed {
            title: title.into(),
            details: details.into(),
        }
    }
}

/// Device enumeration failures
#[derive(Error, Debug)]
pub enum ScanError {
    /// The caller may not enumerate block devices (usually not root)
    #[error("Access to storage devices was denied: {0}")]
    AccessDenied(String),

    /// The enumeration tool could not be run or failed
    #[error("Device enumeration failed: {0}")]
    Command(#[from] crate::command_runner::CommandError),

    /// The enumeration tool produced output we could not understand
    #[error("Could not parse device listing: {0}")]
    Parse(String),

    /// IO errors while probing a device
    #[error("IO error while scanning: {0}")]
    Io(#[from] std::io::Error),
}

/// Main error type for partjob plumbing (config, plans, queue, CLI)
#[derive(Error, Debug)]
pub enum PartJobError {
    /// IO errors (file operations, device access)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Plan file errors
    #[error("Plan error: {0}")]
    Plan(String),

    /// Device scan errors
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// Queue state machine errors
    #[error("Queue error: {0}")]
    Queue(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// General errors (catch-all for edge cases)
    #[error("{0}")]
    General(String),
}

/// Result type alias for partjob plumbing
pub type Result<T> = std::result::Result<T, PartJobError>;

impl PartJobError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a plan error
    pub fn plan(msg: impl Into<String>) -> Self {
        Self::Plan(msg.into())
    }

    /// Create a queue error
    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    /// Create a general error
    pub fn general(msg: impl Into<String>) -> Self {
        Self::General(msg.into())
    }
}
