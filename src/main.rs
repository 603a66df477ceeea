//! Plex Smart Refresher - metadata repair daemon
//!
//! `serve` runs the daily scan scheduler; the other commands operate on the
//! shared state store and exit.

use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use smart_refresher::app::App;
use smart_refresher::cli::{Command, USAGE};
use smart_refresher::config::Config;
use smart_refresher::db::JobSource;
use smart_refresher::jobs::{self, JobError, SchedulerLoop};

#[tokio::main]
async fn main() -> ExitCode {
    let command = match Command::from_args() {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            return ExitCode::from(2);
        }
    };
    if command == Command::Help {
        println!("{}", USAGE);
        return ExitCode::SUCCESS;
    }

    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "smart_refresher=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    match run(command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let app = App::build(config).await?;

    match command {
        Command::Serve | Command::Help => serve(app).await,
        Command::Scan => scan(app).await,
        Command::Cancel { job_id } => {
            if app.coordinator.request_cancel(&job_id).await? {
                println!("cancellation requested for {}", job_id);
            } else {
                println!("job {} is not running", job_id);
            }
            Ok(())
        }
        Command::Jobs { limit } => {
            for job in app.db.scan_jobs().list(limit).await? {
                let finished = job
                    .finished_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {:<11}  {:<9}  started {}  finished {}{}",
                    job.job_id,
                    job.status.as_str(),
                    job.source,
                    job.started_at.to_rfc3339(),
                    finished,
                    job.error.map(|e| format!("  ({})", e)).unwrap_or_default()
                );
            }
            Ok(())
        }
        Command::Tail { job_id, lines } => {
            println!("{}", app.coordinator.tail_log(&job_id, lines).await?);
            Ok(())
        }
        Command::Report { limit } => {
            let totals = app.db.media_state().totals().await?;
            println!(
                "checked {}  fixed {}  failed {}  dry run {}  success rate {:.1}%",
                totals.checked,
                totals.fixed,
                totals.failed,
                totals.dry_run,
                totals.success_rate()
            );
            for record in app.db.media_state().recent(limit, None).await? {
                println!(
                    "{:<10}  {:<8}  {:<20}  {}  {}",
                    record.rating_key,
                    record.state.map(|s| s.as_str()).unwrap_or("-"),
                    record.library.as_deref().unwrap_or("-"),
                    record.title.as_deref().unwrap_or("-"),
                    record.note.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        Command::Libraries => {
            let server = app.connections.get_connection(false).await?;
            for library in server.list_libraries().await? {
                if library.is_scannable() {
                    println!("{:<6}  {:<6}  {}", library.key, library.kind, library.title);
                }
            }
            Ok(())
        }
    }
}

async fn serve(app: App) -> anyhow::Result<()> {
    tracing::info!("Starting Plex Smart Refresher");
    app.prepare_service().await;

    let mut housekeeping = jobs::start_housekeeping(app.coordinator.clone()).await?;

    let scheduler = SchedulerLoop::new(Arc::clone(&app.coordinator))
        .with_poll_interval(app.config.scheduler_poll);
    let scheduler_task = tokio::spawn(scheduler.run(app.shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    app.shutdown.cancel();
    if let Err(e) = scheduler_task.await {
        tracing::error!(error = %e, "Scheduler task ended abnormally");
    }
    if let Err(e) = housekeeping.shutdown().await {
        tracing::warn!(error = %e, "Housekeeping scheduler did not stop cleanly");
    }

    tracing::info!("Stopped");
    Ok(())
}

async fn scan(app: App) -> anyhow::Result<()> {
    app.prepare().await;

    let shutdown = app.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    match app.coordinator.run_now(JobSource::Manual).await {
        Ok((job, status)) => {
            let record = app.db.scan_jobs().get(&job.job_id).await?;
            let stats = record
                .and_then(|r| r.stats)
                .map(|s| s.to_string())
                .unwrap_or_else(|| "{}".to_string());
            println!("job {} finished: {} {}", job.job_id, status, stats);
            Ok(())
        }
        Err(JobError::AlreadyRunning) => {
            println!("a scan is already running");
            Ok(())
        }
        Err(JobError::Store(e)) => Err(e),
    }
}
