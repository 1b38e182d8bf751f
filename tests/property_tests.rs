//! Property-based tests for the partition model
//!
//! These tests verify:
//! - Random add/remove sequences never produce overlapping entries
//! - Every entry stays inside the usable area of its table
//! - Free space is exactly the complement of the allocated ranges
//! - MBR quotas hold (4 primaries, 1 extended)
//! - MBR layouts with logical entries keep them inside the extended one
//! - A failed overlapping move restores the partition whatever the fault offset
//! - The queue stops at whichever job fails first
//! - Enum string round-trips

use partjob::jobs::{CreatePartitionJob, Job, JobContext, MoveFileSystemJob, PartitionJob};
use partjob::model::{mb_to_bytes, DeviceModel, NewPartition, PartitionRef, PartitionTable, TableError, MIB};
use partjob::queue::{JobQueue, JobStatus, QueueState};
use partjob::storage::{MemoryStorage, WriteFault};
use partjob::{FileSystem, JobError, PartitionRole, RunConfig, TableKind};
use proptest::prelude::*;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use strum::IntoEnumIterator;

// =============================================================================
// Table operation sequences
// =============================================================================

const DISK_MB: u64 = 4096;

#[derive(Debug, Clone)]
enum Op {
    Add { size_mb: u64, start_mb: Option<u64> },
    Remove { pick: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u64..600, proptest::option::of(0u64..DISK_MB))
            .prop_map(|(size_mb, start_mb)| Op::Add { size_mb, start_mb }),
        1 => any::<usize>().prop_map(|pick| Op::Remove { pick }),
    ]
}

fn kind_strategy() -> impl Strategy<Value = TableKind> {
    prop_oneof![Just(TableKind::Gpt), Just(TableKind::Mbr)]
}

fn request(size_mb: u64, start_mb: Option<u64>) -> NewPartition {
    NewPartition {
        start: start_mb.map(mb_to_bytes),
        size: mb_to_bytes(size_mb),
        fs: FileSystem::Ext4,
        role: PartitionRole::Primary,
        label: None,
        mount_point: None,
        flags: Vec::new(),
    }
}

fn apply_ops(table: &mut PartitionTable, ops: &[Op]) {
    for op in ops {
        match op {
            // Rejected requests must leave the table untouched; checked by the invariants
            Op::Add { size_mb, start_mb } => {
                let _ = table.add_partition(request(*size_mb, *start_mb));
            }
            Op::Remove { pick } => {
                let numbers: Vec<u32> = table.partitions().iter().map(|p| p.number).collect();
                if !numbers.is_empty() {
                    table.remove_partition(numbers[pick % numbers.len()]).unwrap();
                }
            }
        }
    }
}

proptest! {
    /// No two entries ever share a byte
    #[test]
    fn entries_never_overlap(kind in kind_strategy(), ops in prop::collection::vec(op_strategy(), 0..40)) {
        let mut table = PartitionTable::new(kind, mb_to_bytes(DISK_MB), 512);
        apply_ops(&mut table, &ops);

        let parts = table.partitions();
        for (i, a) in parts.iter().enumerate() {
            for b in &parts[i + 1..] {
                prop_assert!(a.end <= b.start || b.end <= a.start,
                    "{} [{}..{}) overlaps {} [{}..{})", a.number, a.start, a.end, b.number, b.start, b.end);
            }
        }
        prop_assert!(table.validate().is_ok());
    }

    /// Allocated ranges lie within [first_usable, last_usable)
    #[test]
    fn entries_stay_in_usable_area(kind in kind_strategy(), ops in prop::collection::vec(op_strategy(), 0..40)) {
        let mut table = PartitionTable::new(kind, mb_to_bytes(DISK_MB), 512);
        apply_ops(&mut table, &ops);

        for p in table.partitions() {
            prop_assert!(p.start >= table.first_usable);
            prop_assert!(p.end <= table.last_usable);
            prop_assert!(p.start < p.end);
            prop_assert_eq!(p.start % table.sector_size, 0);
        }
    }

    /// Allocated plus free bytes cover the usable area exactly once
    #[test]
    fn free_space_is_complement(kind in kind_strategy(), ops in prop::collection::vec(op_strategy(), 0..40)) {
        let mut table = PartitionTable::new(kind, mb_to_bytes(DISK_MB), 512);
        apply_ops(&mut table, &ops);

        let mut ranges: Vec<(u64, u64)> = table.partitions().iter().map(|p| (p.start, p.end)).collect();
        let free = table.free_space();
        for f in &free {
            prop_assert!(!f.inside_extended);
            prop_assert!(f.size() > 0);
            for p in table.partitions() {
                prop_assert!(!p.overlaps(f.start, f.end));
            }
        }
        ranges.extend(free.iter().map(|f| (f.start, f.end)));
        ranges.sort();

        let mut cursor = table.first_usable;
        for (start, end) in ranges {
            prop_assert_eq!(start, cursor);
            cursor = end;
        }
        prop_assert_eq!(cursor, table.last_usable);
    }

    /// Automatic placement is MiB aligned and never fails while a range fits
    #[test]
    fn automatic_placement_fits_first_range(sizes in prop::collection::vec(1u64..900, 1..8)) {
        let mut table = PartitionTable::new(TableKind::Gpt, mb_to_bytes(DISK_MB), 512);
        for size_mb in sizes {
            let wanted = mb_to_bytes(size_mb);
            let fits = table.free_space().iter().any(|f| {
                let start = f.start.div_ceil(MIB) * MIB;
                start + wanted <= f.end
            });
            let result = table.add_partition(request(size_mb, None));
            prop_assert_eq!(result.is_ok(), fits);
            if let Ok(p) = result {
                prop_assert_eq!(p.start % MIB, 0);
                prop_assert_eq!(p.size(), wanted);
            }
        }
    }

    /// MBR: at most four top-level entries and one extended
    #[test]
    fn mbr_quotas_hold(roles in prop::collection::vec(
        prop_oneof![Just(PartitionRole::Primary), Just(PartitionRole::Extended)], 1..10))
    {
        let mut table = PartitionTable::new(TableKind::Mbr, mb_to_bytes(DISK_MB), 512);
        for role in roles {
            let before = table.clone();
            let result = table.add_partition(NewPartition { role, ..request(100, None) });
            match result {
                Ok(_) => {}
                Err(TableError::TooManyPrimaries) => {
                    prop_assert_eq!(before.primary_count(), 4);
                    prop_assert_eq!(&table, &before);
                }
                Err(TableError::ExtendedExists) => {
                    prop_assert!(before.extended().is_some());
                    prop_assert_eq!(&table, &before);
                }
                Err(e) => prop_assert!(false, "unexpected {}", e),
            }
            prop_assert!(table.primary_count() <= 4);
            let extended = table.partitions().iter().filter(|p| p.role == PartitionRole::Extended).count();
            prop_assert!(extended <= 1);
        }
    }
}

#[test]
fn fifth_primary_fails() {
    let mut table = PartitionTable::new(TableKind::Mbr, mb_to_bytes(DISK_MB), 512);
    for _ in 0..4 {
        table.add_partition(request(100, None)).unwrap();
    }
    assert_eq!(
        table.add_partition(request(100, None)),
        Err(TableError::TooManyPrimaries)
    );
    assert_eq!(table.partitions().len(), 4);
}

#[test]
fn logical_partitions_numbered_from_five() {
    let mut table = PartitionTable::new(TableKind::Mbr, mb_to_bytes(DISK_MB), 512);
    table
        .add_partition(NewPartition {
            role: PartitionRole::Extended,
            ..request(1000, None)
        })
        .unwrap();
    let logical = table
        .add_partition(NewPartition {
            role: PartitionRole::Logical,
            ..request(100, None)
        })
        .unwrap();
    assert_eq!(logical.number, 5);
    let ext = table.extended().unwrap();
    assert!(logical.start > ext.start && logical.end <= ext.end);
}

// =============================================================================
// MBR layouts with extended and logical entries
// =============================================================================

#[derive(Debug, Clone)]
enum MbrOp {
    Add {
        role: PartitionRole,
        size_mb: u64,
        start_mb: Option<u64>,
    },
    Remove {
        pick: usize,
    },
}

fn mbr_op_strategy() -> impl Strategy<Value = MbrOp> {
    let role = prop_oneof![
        2 => Just(PartitionRole::Primary),
        1 => Just(PartitionRole::Extended),
        3 => Just(PartitionRole::Logical),
    ];
    prop_oneof![
        3 => (role, 1u64..900, proptest::option::of(0u64..DISK_MB))
            .prop_map(|(role, size_mb, start_mb)| MbrOp::Add { role, size_mb, start_mb }),
        1 => any::<usize>().prop_map(|pick| MbrOp::Remove { pick }),
    ]
}

fn apply_mbr_ops(table: &mut PartitionTable, ops: &[MbrOp]) {
    for op in ops {
        let before = table.clone();
        match op {
            MbrOp::Add {
                role,
                size_mb,
                start_mb,
            } => {
                if table
                    .add_partition(NewPartition {
                        role: *role,
                        ..request(*size_mb, *start_mb)
                    })
                    .is_err()
                {
                    assert_eq!(*table, before);
                }
            }
            MbrOp::Remove { pick } => {
                let numbers: Vec<u32> = table.partitions().iter().map(|p| p.number).collect();
                if numbers.is_empty() {
                    continue;
                }
                match table.remove_partition(numbers[pick % numbers.len()]) {
                    Ok(_) => {}
                    Err(TableError::ExtendedNotEmpty(_)) => assert_eq!(*table, before),
                    Err(e) => panic!("unexpected {}", e),
                }
            }
        }
    }
}

/// Ranges plus free space tile `[first, last)` exactly once.
fn assert_tiles(mut ranges: Vec<(u64, u64)>, first: u64, last: u64) -> Result<(), TestCaseError> {
    ranges.sort();
    let mut cursor = first;
    for (start, end) in ranges {
        prop_assert_eq!(start, cursor);
        cursor = end;
    }
    prop_assert_eq!(cursor, last);
    Ok(())
}

proptest! {
    /// Logical entries live inside the extended one and are numbered 5, 6, ...
    #[test]
    fn mbr_logicals_stay_inside_extended(ops in prop::collection::vec(mbr_op_strategy(), 0..40)) {
        let mut table = PartitionTable::new(TableKind::Mbr, mb_to_bytes(DISK_MB), 512);
        apply_mbr_ops(&mut table, &ops);
        prop_assert!(table.validate().is_ok());
        prop_assert!(table.primary_count() <= 4);

        let logicals: Vec<_> = table.partitions().iter().filter(|p| p.role == PartitionRole::Logical).collect();
        match table.extended() {
            Some(ext) => {
                for l in &logicals {
                    prop_assert!(l.start >= ext.start + table.sector_size);
                    prop_assert!(l.end <= ext.end);
                }
            }
            None => prop_assert!(logicals.is_empty()),
        }
        let mut numbers: Vec<u32> = logicals.iter().map(|p| p.number).collect();
        numbers.sort_unstable();
        let expected: Vec<u32> = (5..5 + numbers.len() as u32).collect();
        prop_assert_eq!(numbers, expected);

        let parts = table.partitions();
        for (i, a) in parts.iter().enumerate() {
            for b in &parts[i + 1..] {
                let same_level = (a.role == PartitionRole::Logical) == (b.role == PartitionRole::Logical);
                if same_level {
                    prop_assert!(a.end <= b.start || b.end <= a.start,
                        "{} [{}..{}) overlaps {} [{}..{})", a.number, a.start, a.end, b.number, b.start, b.end);
                }
            }
        }
    }

    /// Top-level and in-extended free space each complement their own entries
    #[test]
    fn mbr_free_space_is_complement(ops in prop::collection::vec(mbr_op_strategy(), 0..40)) {
        let mut table = PartitionTable::new(TableKind::Mbr, mb_to_bytes(DISK_MB), 512);
        apply_mbr_ops(&mut table, &ops);
        let free = table.free_space();

        let mut top: Vec<(u64, u64)> = table
            .partitions()
            .iter()
            .filter(|p| p.role != PartitionRole::Logical)
            .map(|p| (p.start, p.end))
            .collect();
        top.extend(free.iter().filter(|f| !f.inside_extended).map(|f| (f.start, f.end)));
        assert_tiles(top, table.first_usable, table.last_usable)?;

        let inner_free = free.iter().filter(|f| f.inside_extended);
        match table.extended() {
            Some(ext) => {
                let mut inner: Vec<(u64, u64)> = table
                    .partitions()
                    .iter()
                    .filter(|p| p.role == PartitionRole::Logical)
                    .map(|p| (p.start, p.end))
                    .collect();
                inner.extend(inner_free.map(|f| (f.start, f.end)));
                assert_tiles(inner, ext.start + table.sector_size, ext.end)?;
            }
            None => prop_assert_eq!(inner_free.count(), 0),
        }
    }
}

// =============================================================================
// Move rollback
// =============================================================================

const MOVE_DISK: &str = "/dev/sdm";
const MOVE_LEN: u64 = 3 * MIB;
const MOVE_TARGET_MB: u64 = 6;

/// 16 MiB disk with a 3 MiB partition at `start`, filled with a pattern.
fn move_disk(start: u64) -> MemoryStorage {
    let storage = MemoryStorage::new();
    storage.add_disk(MOVE_DISK, mb_to_bytes(16), 512);
    let mut table = PartitionTable::new(TableKind::Gpt, mb_to_bytes(16), 512);
    table
        .add_partition(NewPartition {
            start: Some(start),
            ..request(3, None)
        })
        .unwrap();
    storage.set_table(Path::new(MOVE_DISK), Some(table));
    let pattern: Vec<u8> = (0..mb_to_bytes(16)).map(|i| (i % 239) as u8).collect();
    storage.write(Path::new(MOVE_DISK), 0, &pattern);
    storage
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Wherever the copy breaks, in either direction and for any chunk size,
    /// the partition's bytes and table entry are back as they were
    #[test]
    fn failed_move_restores_partition(
        towards_end in any::<bool>(),
        shift_pages in 1u64..768,
        chunk_pages in prop_oneof![Just(1u64), Just(3), Just(16), Just(256)],
        fault_at in 0u64..MOVE_LEN,
    ) {
        let target = mb_to_bytes(MOVE_TARGET_MB);
        let shift = shift_pages * 4096;
        let source = if towards_end { target - shift } else { target + shift };
        let storage = move_disk(source);
        let before = storage.read(Path::new(MOVE_DISK), source, MOVE_LEN as usize);
        storage.inject_write_fault(
            Path::new(MOVE_DISK),
            WriteFault { after_bytes: fault_at, persistent: false },
        );
        let config = RunConfig { copy_chunk_size: chunk_pages * 4096, ..RunConfig::default() };

        let outcome = MoveFileSystemJob::new(PartitionRef::new(MOVE_DISK, 1), FileSystem::Ext4, 512, MOVE_TARGET_MB)
            .run(&JobContext::new(&storage, &config));
        match &outcome.result {
            Err(JobError::OperationFailed { title, .. }) => prop_assert_eq!(
                title.as_str(),
                "Moving of partition /dev/sdm1 failed, changes have been rolled back."
            ),
            other => prop_assert!(false, "unexpected {:?}", other),
        }
        prop_assert!(outcome.changes.is_empty());
        let table = storage.table(Path::new(MOVE_DISK)).unwrap();
        prop_assert_eq!(table.find(1).unwrap().start, source);
        prop_assert!(storage.read(Path::new(MOVE_DISK), source, MOVE_LEN as usize) == before);
    }
}

// =============================================================================
// Queue stop point
// =============================================================================

const QUEUE_DISK: &str = "/dev/vdq";

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Jobs before the failing one commit, the failing one reports, later ones never run
    #[test]
    fn queue_stops_at_first_failure((total, failing) in (1usize..=6).prop_flat_map(|n| (Just(n), 1..=n))) {
        let storage = MemoryStorage::new();
        storage.add_disk(QUEUE_DISK, mb_to_bytes(1000), 512);
        storage.set_table(
            Path::new(QUEUE_DISK),
            Some(PartitionTable::new(TableKind::Gpt, mb_to_bytes(1000), 512)),
        );
        let model = DeviceModel::scan(&storage).unwrap();
        let jobs: Vec<Job> = (1..=total)
            .map(|k| {
                // Job `failing` asks for more than the disk holds
                let size_mb = if k == failing { 5000 } else { 10 };
                Job::CreatePartition(CreatePartitionJob::new(QUEUE_DISK, "", size_mb, FileSystem::Unformatted))
            })
            .collect();

        let (tx, _rx) = mpsc::channel();
        let cancel = AtomicBool::new(false);
        let report = JobQueue::new(jobs)
            .run(&storage, &RunConfig::default(), model, &tx, &cancel)
            .unwrap();

        prop_assert_eq!(report.state, QueueState::Failed);
        prop_assert!(report.error.is_some());
        for (k, status) in report.statuses.iter().enumerate() {
            match (k + 1).cmp(&failing) {
                std::cmp::Ordering::Less => prop_assert_eq!(status, &JobStatus::Succeeded),
                std::cmp::Ordering::Equal => prop_assert!(matches!(status, JobStatus::Failed { .. }), "expected Failed status, got {:?}", status),
                std::cmp::Ordering::Greater => prop_assert_eq!(status, &JobStatus::NotRun),
            }
        }
        prop_assert_eq!(report.not_run().len(), total - failing);

        let on_disk = storage.table(Path::new(QUEUE_DISK)).unwrap();
        prop_assert_eq!(on_disk.partitions().len(), failing - 1);
        prop_assert_eq!(report.model.find_partition_table(Path::new(QUEUE_DISK)), Some(&on_disk));
    }
}

// =============================================================================
// Enum round-trips
// =============================================================================

proptest! {
    /// FileSystem: to_string → parse round-trip is identity
    #[test]
    fn filesystem_roundtrip(index in 0usize..FileSystem::iter().count()) {
        let fs = FileSystem::iter().nth(index).unwrap();
        let parsed: FileSystem = fs.to_string().parse().unwrap();
        prop_assert_eq!(fs, parsed);
        let json = serde_json::to_string(&fs).unwrap();
        prop_assert_eq!(serde_json::from_str::<FileSystem>(&json).unwrap(), fs);
    }

    /// TableKind parses in any case
    #[test]
    fn table_kind_parses(kind in kind_strategy(), upper in any::<bool>()) {
        let s = kind.to_string();
        let s = if upper { s.to_uppercase() } else { s.to_lowercase() };
        let parsed: TableKind = s.parse().unwrap();
        prop_assert_eq!(parsed, kind);
    }
}
