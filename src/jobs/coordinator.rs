//! Scan job coordination
//!
//! Wraps a scan execution as a tracked, cancellable, crash-recoverable job.
//! Two guards keep scans single-flight:
//! - the ledger row (`status = 'running'`), checked atomically on creation
//!   and authoritative across restarts
//! - an in-process mutex acquired without waiting, authoritative for what is
//!   actually executing right now

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDate;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{CreateScanJob, Database, JobSource, JobStatus, ScanJobRecord, ScanSettings};
use crate::services::cancel::{CancelSignal, LedgerCancel};
use crate::services::job_log::{self, JobLog};
use crate::services::scan_engine::{ScanEngine, ScanStats, panic_message};

#[derive(Debug, Error)]
pub enum JobError {
    /// Another job holds the ledger's running slot
    #[error("a scan job is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// What a call to [`ScanCoordinator::start_scan`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAttempt {
    /// Another scan is executing; nothing was run
    Busy,
    /// The media server could not be reached
    Unreachable,
    Completed(ScanStats),
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub log_dir: PathBuf,
    /// Running rows younger than this survive orphan recovery
    pub orphan_grace: chrono::Duration,
    pub log_retention_days: u32,
    pub run_retention_count: u32,
    pub run_retention_days: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./data/logs"),
            orphan_grace: chrono::Duration::minutes(10),
            log_retention_days: 30,
            run_retention_count: 500,
            run_retention_days: 90,
        }
    }
}

/// Outcome of a retention pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub logs_removed: usize,
    pub runs_removed: u64,
}

/// A job launched on its own task
pub struct LaunchedJob {
    pub job: ScanJobRecord,
    pub handle: JoinHandle<JobStatus>,
}

/// Date of the last scheduled scan, cached in memory and persisted on every
/// change
pub struct RunState {
    db: Database,
    cached: parking_lot::Mutex<Option<Option<NaiveDate>>>,
}

impl RunState {
    fn new(db: Database) -> Self {
        Self {
            db,
            cached: parking_lot::Mutex::new(None),
        }
    }

    pub async fn last_run_date(&self) -> anyhow::Result<Option<NaiveDate>> {
        if let Some(cached) = *self.cached.lock() {
            return Ok(cached);
        }
        let stored = self.db.settings().last_run_date().await?;
        *self.cached.lock() = Some(stored);
        Ok(stored)
    }

    pub async fn mark_ran(&self, date: NaiveDate) -> anyhow::Result<()> {
        self.db.settings().set_last_run_date(date).await?;
        *self.cached.lock() = Some(Some(date));
        Ok(())
    }
}

pub struct ScanCoordinator {
    db: Database,
    engine: Arc<ScanEngine>,
    config: CoordinatorConfig,
    scan_lock: Mutex<()>,
    shutdown: CancellationToken,
    recovered: AtomicBool,
    run_state: RunState,
}

impl ScanCoordinator {
    pub fn new(
        db: Database,
        engine: Arc<ScanEngine>,
        config: CoordinatorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            run_state: RunState::new(db.clone()),
            db,
            engine,
            config,
            scan_lock: Mutex::new(()),
            shutdown,
            recovered: AtomicBool::new(false),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn engine(&self) -> &Arc<ScanEngine> {
        &self.engine
    }

    pub fn run_state(&self) -> &RunState {
        &self.run_state
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Create a ledger row for a new job and reserve its log file
    pub async fn create_job(&self, source: JobSource) -> Result<ScanJobRecord, JobError> {
        let job_id = Uuid::new_v4().simple().to_string();
        let log_path = self.config.log_dir.join(job_log::log_file_name(&job_id));

        let job = self
            .db
            .scan_jobs()
            .create_if_idle(&CreateScanJob {
                job_id: job_id.clone(),
                source,
                log_path: log_path.to_string_lossy().into_owned(),
            })
            .await?
            .ok_or(JobError::AlreadyRunning)?;

        JobLog::new(&job_id, &log_path)
            .line(format!("[JOB {}] started (source={})", job_id, source))
            .await;
        Ok(job)
    }

    /// Run one scan if no other scan is executing in this process.
    ///
    /// Returns [`ScanAttempt::Busy`] immediately, without touching the store,
    /// when the execution lock is held.
    pub async fn start_scan(
        &self,
        settings: &ScanSettings,
        log: &JobLog,
        cancel: &dyn CancelSignal,
    ) -> ScanAttempt {
        let Ok(_guard) = self.scan_lock.try_lock() else {
            log.line("Another scan is already running, skipping").await;
            return ScanAttempt::Busy;
        };

        match self.engine.run(settings, log, cancel).await {
            Some(stats) => ScanAttempt::Completed(stats),
            None => ScanAttempt::Unreachable,
        }
    }

    /// Create a job and execute it on its own task
    pub async fn launch(self: &Arc<Self>, source: JobSource) -> Result<LaunchedJob, JobError> {
        let job = self.create_job(source).await?;
        let coordinator = Arc::clone(self);
        let task_job = job.clone();
        let handle = tokio::spawn(async move { coordinator.execute_job(task_job).await });

        info!(job = "scan", job_id = %job.job_id, source = %source, "Scan job launched");
        Ok(LaunchedJob { job, handle })
    }

    /// Launch a job and wait for it to finish
    pub async fn run_now(self: &Arc<Self>, source: JobSource) -> Result<(ScanJobRecord, JobStatus), JobError> {
        let LaunchedJob { job, handle } = self.launch(source).await?;
        let status = match handle.await {
            Ok(status) => status,
            Err(e) => {
                error!(job = "scan", job_id = %job.job_id, error = %e, "Scan task did not complete");
                JobStatus::Failed
            }
        };
        Ok((job, status))
    }

    async fn execute_job(&self, job: ScanJobRecord) -> JobStatus {
        let log = match &job.log_path {
            Some(path) => JobLog::new(&job.job_id, path),
            None => JobLog::detached(),
        };
        let cancel = LedgerCancel::new(self.db.clone(), &job.job_id, Some(self.shutdown.clone()));

        let run = AssertUnwindSafe(async {
            let settings = self.db.settings().load_scan_settings().await?;
            Ok::<_, anyhow::Error>(self.start_scan(&settings, &log, &cancel).await)
        })
        .catch_unwind()
        .await;

        let (status, stats, error) = match run {
            Ok(Ok(ScanAttempt::Completed(stats))) if cancel.was_observed() => {
                (JobStatus::Cancelled, Some(stats), None)
            }
            Ok(Ok(ScanAttempt::Completed(stats))) => (JobStatus::Success, Some(stats), None),
            Ok(Ok(ScanAttempt::Unreachable)) => (
                JobStatus::Failed,
                None,
                Some("media server unreachable".to_string()),
            ),
            Ok(Ok(ScanAttempt::Busy)) => (
                JobStatus::Failed,
                None,
                Some("another scan was already executing".to_string()),
            ),
            Ok(Err(e)) => (JobStatus::Failed, None, Some(format!("{:#}", e))),
            Err(panic) => (
                JobStatus::Failed,
                None,
                Some(format!("scan crashed: {}", panic_message(panic.as_ref()))),
            ),
        };

        let stats_json = stats.and_then(|s| serde_json::to_value(s).ok());
        if let Err(e) = self
            .db
            .scan_jobs()
            .finish(&job.job_id, status, stats_json.as_ref(), error.as_deref())
            .await
        {
            error!(job = "scan", job_id = %job.job_id, error = %e, "Failed to record job status");
        }

        match &error {
            Some(reason) => {
                warn!(job = "scan", job_id = %job.job_id, status = %status, error = %reason, "Scan job finished");
                log.line(format!("[JOB {}] finished: {} ({})", job.job_id, status, reason)).await;
            }
            None => {
                info!(job = "scan", job_id = %job.job_id, status = %status, "Scan job finished");
                log.line(format!("[JOB {}] finished: {}", job.job_id, status)).await;
            }
        }

        status
    }

    /// Flag a running job for cancellation. Returns false if it was not running.
    pub async fn request_cancel(&self, job_id: &str) -> anyhow::Result<bool> {
        let flagged = self.db.scan_jobs().request_cancel(job_id).await?;
        if flagged {
            info!(job = "scan", job_id = %job_id, "Cancellation requested");
        }
        Ok(flagged)
    }

    /// Move jobs orphaned by a previous process to `interrupted`.
    ///
    /// Runs at most once per process; later calls return 0.
    pub async fn recover_orphaned_jobs(&self) -> anyhow::Result<usize> {
        if self.recovered.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }

        let recovered = match self
            .db
            .scan_jobs()
            .mark_orphaned_interrupted(self.config.orphan_grace)
            .await
        {
            Ok(recovered) => recovered,
            Err(e) => {
                self.recovered.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        for job in &recovered {
            if let Some(path) = &job.log_path {
                JobLog::new(&job.job_id, path)
                    .line(format!("[JOB {}] marked interrupted (orphan recovery)", job.job_id))
                    .await;
            }
        }
        if !recovered.is_empty() {
            info!(job = "scan", count = recovered.len(), "Recovered orphaned scan jobs");
        }
        Ok(recovered.len())
    }

    /// Last `lines` lines of a job's log; empty for unknown jobs
    pub async fn tail_log(&self, job_id: &str, lines: usize) -> anyhow::Result<String> {
        let Some(job) = self.db.scan_jobs().get(job_id).await? else {
            return Ok(String::new());
        };
        match job.log_path {
            Some(path) => job_log::tail_file(Path::new(&path), lines).await,
            None => Ok(String::new()),
        }
    }

    /// Apply log and ledger retention
    pub async fn cleanup(&self) -> anyhow::Result<CleanupReport> {
        let logs_removed =
            job_log::cleanup_old_logs(&self.config.log_dir, self.config.log_retention_days).await?;
        let runs_removed = self
            .db
            .scan_jobs()
            .cleanup_old(self.config.run_retention_count, self.config.run_retention_days)
            .await?;

        let report = CleanupReport {
            logs_removed,
            runs_removed,
        };
        if report != CleanupReport::default() {
            info!(job = "housekeeping", logs_removed, runs_removed, "Retention cleanup complete");
        }
        Ok(report)
    }
}
