//! Job Queue
//!
//! Sequential executor for an ordered job list. The queue owns its state and
//! enforces valid transitions:
//!
//! ```text
//! Idle
//!   ↓ start (destructive jobs need confirmation first)
//! Running
//!   ↓
//! Finished | Failed
//! ```
//!
//! Jobs run strictly one after another on one worker thread. The first failing
//! job stops the run: the queue goes to `Failed`, every later job is marked
//! `NotRun`, and the failing job's title and details are surfaced unchanged.
//! Cancellation is honoured only between jobs. Nothing is ever retried.
//!
//! A job whose committed changes cannot be applied to the device model also
//! fails the run: later jobs were planned against a layout that no longer
//! matches what the queue tracks.

use crate::config::RunConfig;
use crate::error::{JobError, PartJobError};
use crate::jobs::{Job, JobContext, PartitionJob};
use crate::model::DeviceModel;
use crate::storage::Storage;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{error, info, warn};

/// Lifecycle of one queue run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Idle,
    Running,
    Finished,
    Failed,
}

impl QueueState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Running => "Running",
            Self::Finished => "Finished",
            Self::Failed => "Failed",
        };
        write!(f, "{}", name)
    }
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueTransitionError {
    /// The queue already finished or failed; build a fresh one to run again
    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: QueueState },

    #[error("Queue is already running")]
    AlreadyRunning,

    #[error("Cannot complete a queue in state {from}")]
    NotRunning { from: QueueState },

    /// Destructive jobs were queued without explicit confirmation
    #[error("{count} destructive job(s) require explicit confirmation")]
    MissingConfirmation { count: usize },

    #[error("Invalid run configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl From<QueueTransitionError> for PartJobError {
    fn from(err: QueueTransitionError) -> Self {
        PartJobError::queue(err.to_string())
    }
}

/// Result of one job within a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Succeeded,
    Failed { title: String, message: String },
    /// Skipped because an earlier job failed or the run was cancelled
    NotRun,
}

/// Observer notifications, in order of occurrence
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// About to run job `index` (0-based) of `total`
    Progress {
        index: usize,
        total: usize,
        description: String,
    },
    /// Intermediate status from inside a running job
    Status { index: usize, message: String },
    JobFinished { index: usize, status: JobStatus },
    Finished,
    Failed {
        title: String,
        message: String,
        fatal: bool,
    },
}

/// Everything the caller needs after a run.
#[derive(Debug, Clone)]
pub struct QueueReport {
    pub state: QueueState,
    pub statuses: Vec<JobStatus>,
    /// Plan review summary of each job, parallel to `statuses`
    pub summaries: Vec<String>,
    pub error: Option<JobError>,
    pub cancelled: bool,
    /// Storage integrity is unknown; the installer must not continue
    pub do_not_proceed: bool,
    /// A committed change could not be applied; `model` lags the disk
    pub model_stale: bool,
    /// Device model with every committed change applied
    pub model: DeviceModel,
}

impl QueueReport {
    pub fn succeeded(&self) -> bool {
        self.state == QueueState::Finished
    }

    /// Summaries of the jobs that never ran, in queue order.
    pub fn not_run(&self) -> Vec<&str> {
        self.statuses
            .iter()
            .zip(&self.summaries)
            .filter(|(status, _)| **status == JobStatus::NotRun)
            .map(|(_, summary)| summary.as_str())
            .collect()
    }
}

/// Ordered job list plus its run state.
#[derive(Debug)]
pub struct JobQueue {
    jobs: Vec<Job>,
    state: QueueState,
    statuses: Vec<JobStatus>,
    destructive_confirmed: bool,
}

impl JobQueue {
    pub fn new(jobs: Vec<Job>) -> Self {
        let statuses = vec![JobStatus::Pending; jobs.len()];
        Self {
            jobs,
            state: QueueState::Idle,
            statuses,
            destructive_confirmed: false,
        }
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn statuses(&self) -> &[JobStatus] {
        &self.statuses
    }

    pub fn destructive_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.is_destructive()).count()
    }

    /// Operator acknowledged that destructive jobs cannot be undone.
    pub fn confirm_destructive(&mut self) {
        self.destructive_confirmed = true;
    }

    /// Idle → Running.
    pub fn start(&mut self) -> Result<(), QueueTransitionError> {
        match self.state {
            QueueState::Idle => {}
            QueueState::Running => return Err(QueueTransitionError::AlreadyRunning),
            from => return Err(QueueTransitionError::FromTerminalState { from }),
        }
        let count = self.destructive_count();
        if count > 0 && !self.destructive_confirmed {
            return Err(QueueTransitionError::MissingConfirmation { count });
        }
        self.state = QueueState::Running;
        Ok(())
    }

    /// Running → Finished or Failed.
    fn complete(&mut self, success: bool) -> Result<(), QueueTransitionError> {
        if self.state != QueueState::Running {
            return Err(QueueTransitionError::NotRunning { from: self.state });
        }
        self.state = if success {
            QueueState::Finished
        } else {
            QueueState::Failed
        };
        Ok(())
    }

    /// Idle → Running with `config` checked first.
    fn start_with(&mut self, config: &RunConfig) -> Result<(), QueueTransitionError> {
        config
            .validate()
            .map_err(|e| QueueTransitionError::InvalidConfig {
                reason: e.to_string(),
            })?;
        self.start()
    }

    /// Run every job on the calling thread.
    pub fn run(
        mut self,
        storage: &dyn Storage,
        config: &RunConfig,
        model: DeviceModel,
        events: &Sender<QueueEvent>,
        cancel: &AtomicBool,
    ) -> Result<QueueReport, QueueTransitionError> {
        self.start_with(config)?;
        self.execute(storage, config, model, events, cancel)
    }

    /// Run every job on a dedicated worker thread.
    ///
    /// Transition errors (such as missing confirmation) surface here, before
    /// the worker exists.
    pub fn spawn(
        mut self,
        storage: Arc<dyn Storage>,
        config: RunConfig,
        model: DeviceModel,
    ) -> Result<QueueHandle, PartJobError> {
        self.start_with(&config)?;
        let (tx, rx) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let worker_cancel = Arc::clone(&cancel);

        let worker = thread::Builder::new()
            .name("partjob-queue".to_string())
            .spawn(move || {
                self.execute(storage.as_ref(), &config, model, &tx, &worker_cancel)
                    .map_err(PartJobError::from)
            })
            .map_err(|e| PartJobError::queue(format!("failed to spawn queue worker: {}", e)))?;

        Ok(QueueHandle {
            events: rx,
            cancel,
            worker,
        })
    }

    fn execute(
        mut self,
        storage: &dyn Storage,
        config: &RunConfig,
        mut model: DeviceModel,
        events: &Sender<QueueEvent>,
        cancel: &AtomicBool,
    ) -> Result<QueueReport, QueueTransitionError> {
        let total = self.jobs.len();
        let mut failure: Option<JobError> = None;
        let mut cancelled = false;
        let mut model_stale = false;
        // Observers may have gone away; events are advisory
        let emit = |event: QueueEvent| {
            let _ = events.send(event);
        };

        info!("Job queue started with {} job(s)", total);
        for index in 0..total {
            if cancel.load(Ordering::SeqCst) {
                warn!("Queue cancelled before job {} of {}", index + 1, total);
                cancelled = true;
                break;
            }

            let job = &self.jobs[index];
            let description = job.describe();
            info!("[{}/{}] {}", index + 1, total, description.status);
            emit(QueueEvent::Progress {
                index,
                total,
                description: description.status.clone(),
            });

            let status_sink = |message: &str| {
                emit(QueueEvent::Status {
                    index,
                    message: message.to_string(),
                })
            };
            let ctx = JobContext::new(storage, config).with_status(&status_sink);
            let mut outcome = job.run(&ctx);

            let mut diverged = Vec::new();
            for change in &outcome.changes {
                if let Err(e) = model.apply(change) {
                    error!("Device model diverged from disk after job {}: {}", index + 1, e);
                    diverged.push(e.to_string());
                }
            }
            if !diverged.is_empty() {
                model_stale = true;
                // The job's own failure explains more than the divergence
                if outcome.result.is_ok() {
                    outcome.result = Err(JobError::operation(
                        format!(
                            "The device layout changed unexpectedly after: {}",
                            description.summary
                        ),
                        diverged.join("\n"),
                    ));
                }
            }

            let status = match &outcome.result {
                Ok(()) => JobStatus::Succeeded,
                Err(e) => {
                    error!("Job {} failed: {}", index + 1, e);
                    JobStatus::Failed {
                        title: e.title(),
                        message: e.details(),
                    }
                }
            };
            self.statuses[index] = status.clone();
            emit(QueueEvent::JobFinished { index, status });

            if let Err(e) = outcome.result {
                failure = Some(e);
                break;
            }
        }

        for status in self.statuses.iter_mut() {
            if *status == JobStatus::Pending {
                *status = JobStatus::NotRun;
            }
        }

        let do_not_proceed = failure.as_ref().is_some_and(JobError::is_fatal);
        let success = failure.is_none() && !cancelled;
        self.complete(success)?;

        match (&failure, cancelled) {
            (Some(e), _) => emit(QueueEvent::Failed {
                title: e.title(),
                message: e.details(),
                fatal: e.is_fatal(),
            }),
            (None, true) => emit(QueueEvent::Failed {
                title: "Installation cancelled".to_string(),
                message: "The remaining jobs were not run.".to_string(),
                fatal: false,
            }),
            (None, false) => emit(QueueEvent::Finished),
        }
        info!("Job queue {}", self.state);

        let summaries = self.jobs.iter().map(|j| j.describe().summary).collect();
        Ok(QueueReport {
            state: self.state,
            statuses: self.statuses,
            summaries,
            error: failure,
            cancelled,
            do_not_proceed,
            model_stale,
            model,
        })
    }
}

/// Observer side of a spawned queue
pub struct QueueHandle {
    events: Receiver<QueueEvent>,
    cancel: Arc<AtomicBool>,
    worker: JoinHandle<Result<QueueReport, PartJobError>>,
}

impl QueueHandle {
    pub fn events(&self) -> &Receiver<QueueEvent> {
        &self.events
    }

    /// Stop before the next job starts. A running job is never interrupted.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// The flag behind [`cancel`](Self::cancel), for signal handlers.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Wait for the worker and collect its report.
    pub fn join(self) -> Result<QueueReport, PartJobError> {
        self.worker
            .join()
            .map_err(|_| PartJobError::queue("queue worker panicked"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{CheckFileSystemJob, CreatePartitionTableJob, FormatPartitionJob};
    use crate::model::{mb_to_bytes, PartitionRef};
    use crate::storage::MemoryStorage;
    use crate::types::{FileSystem, TableKind};

    fn check(n: u32) -> Job {
        Job::CheckFileSystem(CheckFileSystemJob::new(
            PartitionRef::new("/dev/sda", n),
            FileSystem::Ext4,
        ))
    }

    #[test]
    fn test_start_transitions() {
        let mut queue = JobQueue::new(vec![check(1)]);
        assert_eq!(queue.state(), QueueState::Idle);
        queue.start().unwrap();
        assert_eq!(queue.state(), QueueState::Running);
        assert_eq!(queue.start(), Err(QueueTransitionError::AlreadyRunning));
        queue.complete(true).unwrap();
        assert_eq!(
            queue.start(),
            Err(QueueTransitionError::FromTerminalState {
                from: QueueState::Finished
            })
        );
    }

    #[test]
    fn test_complete_requires_running() {
        let mut queue = JobQueue::new(Vec::new());
        assert_eq!(
            queue.complete(true),
            Err(QueueTransitionError::NotRunning {
                from: QueueState::Idle
            })
        );
    }

    #[test]
    fn test_destructive_jobs_need_confirmation() {
        let mut queue = JobQueue::new(vec![Job::FormatPartition(FormatPartitionJob::new(
            PartitionRef::new("/dev/sda", 1),
            "",
            FileSystem::Ext4,
            100,
        ))]);
        assert_eq!(
            queue.start(),
            Err(QueueTransitionError::MissingConfirmation { count: 1 })
        );
        assert_eq!(queue.state(), QueueState::Idle);
        queue.confirm_destructive();
        assert!(queue.start().is_ok());
    }

    #[test]
    fn test_run_emits_events_in_order() {
        let storage = MemoryStorage::new();
        storage.add_disk("/dev/sda", mb_to_bytes(100), 512);
        let model = DeviceModel::scan(&storage).unwrap();
        let mut queue = JobQueue::new(vec![
            Job::CreatePartitionTable(CreatePartitionTableJob::new("/dev/sda", "", TableKind::Gpt)),
            check(1),
        ]);
        queue.confirm_destructive();

        let (tx, rx) = mpsc::channel();
        let cancel = AtomicBool::new(false);
        let report = queue
            .run(&storage, &RunConfig::default(), model, &tx, &cancel)
            .unwrap();
        drop(tx);

        assert!(report.succeeded());
        assert!(report.model.find_partition_table(std::path::Path::new("/dev/sda")).is_some());
        let events: Vec<QueueEvent> = rx.iter().collect();
        assert!(matches!(events[0], QueueEvent::Progress { index: 0, total: 2, .. }));
        assert!(matches!(events[1], QueueEvent::JobFinished { index: 0, .. }));
        assert!(matches!(events[2], QueueEvent::Progress { index: 1, .. }));
        assert_eq!(events.last(), Some(&QueueEvent::Finished));
    }

    #[test]
    fn test_cancel_before_start_runs_nothing() {
        let storage = MemoryStorage::new();
        let queue = JobQueue::new(vec![check(1), check(2)]);
        let (tx, _rx) = mpsc::channel();
        let cancel = AtomicBool::new(true);
        let report = queue
            .run(&storage, &RunConfig::default(), DeviceModel::default(), &tx, &cancel)
            .unwrap();
        assert_eq!(report.state, QueueState::Failed);
        assert!(report.cancelled);
        assert!(!report.do_not_proceed);
        assert_eq!(report.statuses, vec![JobStatus::NotRun, JobStatus::NotRun]);
        assert_eq!(
            report.not_run(),
            vec![
                "Check file system on partition /dev/sda1.",
                "Check file system on partition /dev/sda2."
            ]
        );
        assert!(storage.tool_log().is_empty());
    }

    #[test]
    fn test_invalid_config_refused_before_start() {
        let storage = MemoryStorage::new();
        let mut config = RunConfig::default();
        config.copy_chunk_size = 0;
        let (tx, _rx) = mpsc::channel();
        let cancel = AtomicBool::new(false);
        let result = JobQueue::new(vec![check(1)]).run(
            &storage,
            &config,
            DeviceModel::default(),
            &tx,
            &cancel,
        );
        assert!(matches!(
            result,
            Err(QueueTransitionError::InvalidConfig { ref reason }) if reason.contains("chunk size")
        ));
    }

    #[test]
    fn test_spawned_queue_reports() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let handle = JobQueue::new(vec![check(1)])
            .spawn(storage, RunConfig::default(), DeviceModel::default())
            .unwrap();
        let events: Vec<QueueEvent> = handle.events().iter().collect();
        assert_eq!(events.last(), Some(&QueueEvent::Finished));
        let report = handle.join().unwrap();
        assert_eq!(report.statuses, vec![JobStatus::Succeeded]);
    }
}
