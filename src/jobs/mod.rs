//! Scan jobs and background scheduling

pub mod coordinator;
pub mod scheduler;

pub use coordinator::{CleanupReport, CoordinatorConfig, JobError, LaunchedJob, ScanAttempt, ScanCoordinator};
pub use scheduler::SchedulerLoop;

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

/// Start the cron scheduler that runs daily retention cleanup
pub async fn start_housekeeping(coordinator: Arc<ScanCoordinator>) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Log and ledger retention - run daily at 3:30 AM
    let cleanup_job = Job::new_async("0 30 3 * * *", move |_uuid, _l| {
        let coordinator = coordinator.clone();
        Box::pin(async move {
            info!(job = "housekeeping", "Running retention cleanup");
            if let Err(e) = coordinator.cleanup().await {
                tracing::error!(job = "housekeeping", error = %e, "Retention cleanup failed");
            }
        })
    })?;
    scheduler.add(cleanup_job).await?;

    scheduler.start().await?;

    info!("Housekeeping scheduler started");
    Ok(scheduler)
}
