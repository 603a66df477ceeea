//! Daily scan trigger
//!
//! A ticker task that launches at most one scheduled scan per calendar day,
//! when the local clock is within a tolerance window of the configured time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::coordinator::{JobError, ScanCoordinator};
use crate::db::JobSource;
use crate::db::settings::DEFAULT_SCHEDULE_TIME;

/// How far from the target time a poll may land and still trigger
pub const TRIGGER_TOLERANCE: chrono::Duration = chrono::Duration::seconds(120);

/// Parse a `HH:MM` schedule time, falling back to the default on bad input
pub fn parse_schedule_time(value: &str) -> NaiveTime {
    match NaiveTime::parse_from_str(value.trim(), "%H:%M") {
        Ok(time) => time,
        Err(_) => {
            warn!(schedule_time = %value, default = DEFAULT_SCHEDULE_TIME, "Invalid schedule time, using default");
            default_schedule_time()
        }
    }
}

fn default_schedule_time() -> NaiveTime {
    NaiveTime::from_hms_opt(4, 0, 0).unwrap_or(NaiveTime::MIN)
}

/// Whether a scheduled scan is due at `now`
pub fn should_trigger(
    now: NaiveDateTime,
    schedule_time: NaiveTime,
    last_run: Option<NaiveDate>,
    tolerance: chrono::Duration,
) -> bool {
    let today = now.date();
    if last_run == Some(today) {
        return false;
    }
    let target = today.and_time(schedule_time);
    (now - target).abs() <= tolerance
}

pub struct SchedulerLoop {
    coordinator: Arc<ScanCoordinator>,
    poll_interval: Duration,
    error_backoff: Duration,
}

impl SchedulerLoop {
    pub fn new(coordinator: Arc<ScanCoordinator>) -> Self {
        Self {
            coordinator,
            poll_interval: Duration::from_secs(30),
            error_backoff: Duration::from_secs(60),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Poll until `shutdown` fires. Errors never end the loop.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            poll_secs = self.poll_interval.as_secs(),
            "Scan scheduler started"
        );

        loop {
            let delay = match self.tick(Local::now().naive_local()).await {
                Ok(_) => self.poll_interval,
                Err(e) => {
                    error!(error = %e, "Scheduler iteration failed");
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Scan scheduler stopped");
    }

    /// One poll. Returns whether a scan was triggered.
    pub async fn tick(&self, now: NaiveDateTime) -> Result<bool> {
        let settings = self.coordinator.db().settings().load_scan_settings().await?;
        if !settings.schedule_active {
            return Ok(false);
        }

        let schedule_time = parse_schedule_time(&settings.schedule_time);
        let run_state = self.coordinator.run_state();
        let last_run = run_state.last_run_date().await?;
        if !should_trigger(now, schedule_time, last_run, TRIGGER_TOLERANCE) {
            return Ok(false);
        }

        // Recorded before the scan so a slow or failing scan is not retried
        // within the same window
        run_state.mark_ran(now.date()).await?;
        info!(schedule_time = %schedule_time.format("%H:%M"), "Scheduled scan due");

        match self.coordinator.run_now(JobSource::Scheduler).await {
            Ok((job, status)) => {
                info!(job = "scan", job_id = %job.job_id, status = %status, "Scheduled scan finished");
            }
            Err(JobError::AlreadyRunning) => {
                info!("A scan is already running, skipping scheduled scan");
            }
            Err(JobError::Store(e)) => return Err(e),
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn four() -> NaiveTime {
        NaiveTime::from_hms_opt(4, 0, 0).unwrap()
    }

    #[test]
    fn test_triggers_inside_window() {
        assert!(should_trigger(at("2024-05-01", "04:00:00"), four(), None, TRIGGER_TOLERANCE));
        assert!(should_trigger(at("2024-05-01", "03:58:00"), four(), None, TRIGGER_TOLERANCE));
        assert!(should_trigger(at("2024-05-01", "04:02:00"), four(), None, TRIGGER_TOLERANCE));
    }

    #[test]
    fn test_does_not_trigger_outside_window() {
        assert!(!should_trigger(at("2024-05-01", "04:02:01"), four(), None, TRIGGER_TOLERANCE));
        assert!(!should_trigger(at("2024-05-01", "03:57:59"), four(), None, TRIGGER_TOLERANCE));
        assert!(!should_trigger(at("2024-05-01", "16:00:00"), four(), None, TRIGGER_TOLERANCE));
    }

    #[test]
    fn test_runs_once_per_day() {
        let today = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let yesterday = NaiveDate::from_ymd_opt(2024, 4, 30).unwrap();
        assert!(!should_trigger(at("2024-05-01", "04:00:30"), four(), Some(today), TRIGGER_TOLERANCE));
        assert!(should_trigger(at("2024-05-01", "04:00:30"), four(), Some(yesterday), TRIGGER_TOLERANCE));
    }

    #[test]
    fn test_schedule_time_parsing() {
        assert_eq!(parse_schedule_time("23:15"), NaiveTime::from_hms_opt(23, 15, 0).unwrap());
        assert_eq!(parse_schedule_time(" 07:05 "), NaiveTime::from_hms_opt(7, 5, 0).unwrap());
        assert_eq!(parse_schedule_time("25:00"), four());
        assert_eq!(parse_schedule_time("soon"), four());
        assert_eq!(parse_schedule_time(""), four());
    }
}
