//! End-to-end scenarios: plan file → job list → queue → model
//!
//! Every scenario runs against in-memory disks, so nothing here needs root.

use partjob::engine::{build_plan, PlanError, PlanFile};
use partjob::model::{mb_to_bytes, DeviceModel, NewPartition, PartitionRef, PartitionTable, MIB};
use partjob::queue::{JobQueue, JobStatus, QueueState};
use partjob::storage::{MemoryStorage, Storage};
use partjob::{BootLoaderTarget, FileSystem, FirmwareMode, JobError, PartitionRole, RunConfig, TableKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// `/dev/sda`, 100000 MB, GPT, one 50000 MB ext4 partition at the front.
fn half_used_disk() -> MemoryStorage {
    let storage = MemoryStorage::new();
    storage.add_disk("/dev/sda", mb_to_bytes(100_000), 512);
    let mut table = PartitionTable::new(TableKind::Gpt, mb_to_bytes(100_000), 512);
    table
        .add_partition(NewPartition {
            start: None,
            size: mb_to_bytes(50_000),
            fs: FileSystem::Ext4,
            role: PartitionRole::Primary,
            label: None,
            mount_point: None,
            flags: Vec::new(),
        })
        .unwrap();
    storage.set_table(Path::new("/dev/sda"), Some(table));
    storage
}

fn run_plan(storage: Arc<MemoryStorage>, json: &str, firmware: FirmwareMode) -> partjob::QueueReport {
    let model = DeviceModel::scan(storage.as_ref()).unwrap();
    let plan = build_plan(&PlanFile::from_json(json).unwrap(), &model, firmware).unwrap();
    let mut queue: JobQueue = plan.into_queue();
    queue.confirm_destructive();
    let shared: Arc<dyn Storage> = storage;
    queue
        .spawn(shared, RunConfig::default(), model)
        .unwrap()
        .join()
        .unwrap()
}

#[test]
fn test_create_partition_in_remaining_space() {
    let storage = Arc::new(half_used_disk());
    let model = DeviceModel::scan(storage.as_ref()).unwrap();

    let table = model.find_partition_table(Path::new("/dev/sda")).unwrap();
    let free = model.free_space_ranges(Path::new("/dev/sda"));
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].start, table.find(1).unwrap().end);
    assert!(free[0].size() > mb_to_bytes(49_000));

    let report = run_plan(
        Arc::clone(&storage),
        r#"{ "firmware": "bios", "boot_device": "/dev/sda", "jobs": [
            { "kind": "create_partition", "device": "/dev/sda", "size_mb": 20000,
              "filesystem": "ext4", "mount_point": "/" }
        ]}"#,
        FirmwareMode::Bios,
    );
    assert_eq!(report.state, QueueState::Finished);
    assert_eq!(storage.tool_log(), vec!["mkfs ext4 /dev/sda2"]);

    let created = report
        .model
        .find_partition(&PartitionRef::new("/dev/sda", 2))
        .unwrap();
    assert_eq!(created.size(), mb_to_bytes(20_000));
    assert_eq!(created.start, mb_to_bytes(50_001));
    assert_eq!(created.fs, FileSystem::Ext4);
    assert_eq!(created.start % MIB, 0);

    let remaining = report.model.free_space_ranges(Path::new("/dev/sda"));
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].start, created.end);
}

#[test]
fn test_efi_without_esp_yields_no_plan() {
    let storage = half_used_disk();
    let model = DeviceModel::scan(&storage).unwrap();
    let file = PlanFile::from_json(
        r#"{ "firmware": "uefi", "boot_device": "/dev/sda", "jobs": [
            { "kind": "create_partition", "device": "/dev/sda", "size_mb": 20000, "filesystem": "ext4" }
        ]}"#,
    )
    .unwrap();
    match build_plan(&file, &model, FirmwareMode::Uefi) {
        Err(PlanError::Boot(JobError::BootTargetUnavailable { details })) => {
            assert!(details.contains("EFI system partition"));
        }
        other => panic!("unexpected {:?}", other.map(|p| p.summary())),
    }
    // Nothing ran
    assert!(storage.tool_log().is_empty());
}

#[test]
fn test_efi_plan_adding_esp() {
    let storage = Arc::new(half_used_disk());
    let report = run_plan(
        Arc::clone(&storage),
        r#"{ "firmware": "uefi", "boot_device": "/dev/sda", "jobs": [
            { "kind": "create_partition", "device": "/dev/sda", "size_mb": 300,
              "filesystem": "fat32", "mount_point": "/boot/efi", "flags": ["esp"] }
        ]}"#,
        FirmwareMode::Uefi,
    );
    assert!(report.succeeded());
    let model = DeviceModel::scan(storage.as_ref()).unwrap();
    let target = partjob::bootloader::resolve(&model, FirmwareMode::Uefi, Path::new("/dev/sda"), None)
        .unwrap();
    assert_eq!(target, BootLoaderTarget::Esp(PathBuf::from("/dev/sda2")));
}

#[test]
fn test_shrink_then_move_layout() {
    let storage = Arc::new(half_used_disk());
    let report = run_plan(
        Arc::clone(&storage),
        r#"{ "firmware": "bios", "boot_device": "/dev/sda", "jobs": [
            { "kind": "resize_partition", "device": "/dev/sda", "partition": 1, "size_mb": 10 },
            { "kind": "move_file_system", "device": "/dev/sda", "partition": 1, "start_mb": 2 }
        ]}"#,
        FirmwareMode::Bios,
    );
    assert_eq!(report.state, QueueState::Finished, "{:?}", report.error);
    // resize + check guard + move
    assert_eq!(report.statuses, vec![JobStatus::Succeeded; 3]);

    let part = storage.table(Path::new("/dev/sda")).unwrap().find(1).unwrap().clone();
    assert_eq!(part.start, mb_to_bytes(2));
    assert_eq!(part.size(), mb_to_bytes(10));
    assert_eq!(
        report.model.find_partition(&PartitionRef::new("/dev/sda", 1)),
        Some(&part)
    );
}

#[test]
fn test_resize_below_minimum_fails_plan_run() {
    let storage = Arc::new(half_used_disk());
    storage.set_min_size("/dev/sda1", mb_to_bytes(30_000));
    let report = run_plan(
        Arc::clone(&storage),
        r#"{ "firmware": "bios", "boot_device": "/dev/sda", "jobs": [
            { "kind": "resize_partition", "device": "/dev/sda", "partition": 1, "size_mb": 20000 },
            { "kind": "create_partition", "device": "/dev/sda", "size_mb": 1000 }
        ]}"#,
        FirmwareMode::Bios,
    );
    assert_eq!(report.state, QueueState::Failed);
    assert!(matches!(report.error, Some(JobError::OperationFailed { .. })));
    assert_eq!(report.statuses[1], JobStatus::NotRun);
    assert_eq!(
        storage.table(Path::new("/dev/sda")).unwrap().find(1).unwrap().size(),
        mb_to_bytes(50_000)
    );
}
