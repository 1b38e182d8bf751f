//! partjob Library
//!
//! Partition-mutation core for system installers: a device/partition model,
//! seven job kinds with rollback-aware moves, a sequential job queue and the
//! boot-loader resolver.

pub mod bootloader;
pub mod cli;
pub mod command_runner;
pub mod config;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod jobs;
pub mod model;
pub mod process_guard;
pub mod queue;
pub mod storage;
pub mod types;

// Re-export main types for convenience
pub use bootloader::{BootLoaderTarget, BootSelection};
pub use config::{RunConfig, ToolTimeouts};
pub use engine::{build_plan, Plan, PlanError, PlanFile};
pub use error::{JobError, PartJobError, ScanError};
pub use hardware::FirmwareMode;
pub use jobs::{Job, JobContext, JobDescription, JobOutcome, PartitionJob};
pub use model::{Device, DeviceModel, Partition, PartitionRef, PartitionTable, TableChange};
pub use process_guard::{ChildRegistry, ProcessGuard};
pub use queue::{JobQueue, JobStatus, QueueEvent, QueueHandle, QueueReport, QueueState};
pub use storage::{MemoryStorage, Storage, SystemStorage};
pub use types::{BootMode, DiskLabel, FileSystem, PartitionFlag, PartitionRole, TableKind};
