//! Scan job ledger
//!
//! One row per scan execution. A row is created in `running` state and is
//! moved to a terminal state exactly once; terminal states are absorbing,
//! so every status write is guarded by `status = 'running'`.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::SqlitePool;

use crate::db::sqlite_helpers::{
    datetime_to_str, from_json_opt, int_to_bool, now_iso8601, str_to_datetime,
    str_to_datetime_opt,
};

/// Lifecycle status of a scan job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Success,
    Failed,
    Cancelled,
    Interrupted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "interrupted" => Ok(JobStatus::Interrupted),
            other => Err(anyhow!("Unknown job status '{}'", other)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What launched a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    Manual,
    Scheduler,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::Manual => "manual",
            JobSource::Scheduler => "scheduler",
        }
    }
}

impl fmt::Display for JobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scan job ledger row
#[derive(Debug, Clone)]
pub struct ScanJobRecord {
    pub job_id: String,
    pub source: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub log_path: Option<String>,
    pub stats: Option<JsonValue>,
    pub error: Option<String>,
    pub cancel_requested: bool,
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for ScanJobRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use sqlx::Row;

        let status: String = row.try_get("status")?;
        let started_at: String = row.try_get("started_at")?;
        let finished_at: Option<String> = row.try_get("finished_at")?;
        let stats_json: Option<String> = row.try_get("stats_json")?;
        let cancel_requested: i64 = row.try_get("cancel_requested")?;

        Ok(Self {
            job_id: row.try_get("job_id")?,
            source: row.try_get("source")?,
            status: status
                .parse()
                .map_err(|e: anyhow::Error| sqlx::Error::Decode(e.into()))?,
            started_at: str_to_datetime(&started_at)
                .map_err(|e| sqlx::Error::Decode(e.into()))?,
            finished_at: str_to_datetime_opt(finished_at.as_deref())
                .map_err(|e| sqlx::Error::Decode(e.into()))?,
            log_path: row.try_get("log_path")?,
            stats: from_json_opt(stats_json.as_deref())
                .map_err(|e| sqlx::Error::Decode(e.into()))?,
            error: row.try_get("error")?,
            cancel_requested: int_to_bool(cancel_requested),
        })
    }
}

/// Input for creating a job
#[derive(Debug, Clone)]
pub struct CreateScanJob {
    pub job_id: String,
    pub source: JobSource,
    pub log_path: String,
}

pub struct ScanJobRepository {
    pool: SqlitePool,
}

impl ScanJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a `running` row unless another job is already running.
    ///
    /// The existence check and the insert are one statement, so two callers
    /// racing here cannot both succeed. Returns the new row, or `None` when a
    /// job was already running.
    pub async fn create_if_idle(&self, input: &CreateScanJob) -> Result<Option<ScanJobRecord>> {
        let result = sqlx::query(
            r#"
            INSERT INTO scan_runs (job_id, source, status, started_at, log_path, cancel_requested)
            SELECT ?1, ?2, 'running', ?3, ?4, 0
            WHERE NOT EXISTS (SELECT 1 FROM scan_runs WHERE status = 'running')
            "#,
        )
        .bind(&input.job_id)
        .bind(input.source.as_str())
        .bind(now_iso8601())
        .bind(&input.log_path)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get(&input.job_id).await
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<ScanJobRecord>> {
        let record =
            sqlx::query_as::<_, ScanJobRecord>("SELECT * FROM scan_runs WHERE job_id = ?1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    /// The newest running job, if any
    pub async fn get_running(&self) -> Result<Option<ScanJobRecord>> {
        let record = sqlx::query_as::<_, ScanJobRecord>(
            "SELECT * FROM scan_runs WHERE status = 'running' ORDER BY started_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn list(&self, limit: u32) -> Result<Vec<ScanJobRecord>> {
        let records = sqlx::query_as::<_, ScanJobRecord>(
            "SELECT * FROM scan_runs ORDER BY started_at DESC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Flag a running job for cancellation. No-op for finished jobs.
    pub async fn request_cancel(&self, job_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE scan_runs SET cancel_requested = 1 WHERE job_id = ?1 AND status = 'running'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn is_cancel_requested(&self, job_id: &str) -> Result<bool> {
        let flag: Option<(i64,)> =
            sqlx::query_as("SELECT cancel_requested FROM scan_runs WHERE job_id = ?1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(flag.map(|(v,)| int_to_bool(v)).unwrap_or(false))
    }

    /// Move a running job to a terminal status.
    ///
    /// Returns false if the job was not running (already terminal or unknown).
    pub async fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        stats: Option<&JsonValue>,
        error: Option<&str>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(anyhow!("Cannot finish job {} with non-terminal status", job_id));
        }

        let stats_json = stats.map(|s| s.to_string());
        let result = sqlx::query(
            r#"
            UPDATE scan_runs
               SET status = ?1,
                   finished_at = ?2,
                   stats_json = COALESCE(?3, stats_json),
                   error = COALESCE(?4, error)
             WHERE job_id = ?5 AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(now_iso8601())
        .bind(stats_json)
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Reconcile jobs left `running` by a process that is gone.
    ///
    /// Only rows that started more than `grace` ago are touched, so a quick
    /// restart does not clobber a job that is still alive. Returns the rows
    /// that were moved to `interrupted`.
    pub async fn mark_orphaned_interrupted(&self, grace: Duration) -> Result<Vec<ScanJobRecord>> {
        let now = Utc::now();
        let cutoff = now - grace.max(Duration::zero());

        let records = sqlx::query_as::<_, ScanJobRecord>(
            r#"
            UPDATE scan_runs
               SET status = 'interrupted',
                   finished_at = ?1,
                   error = COALESCE(error, 'Process restarted (orphan recovery)')
             WHERE status = 'running' AND started_at < ?2
            RETURNING *
            "#,
        )
        .bind(datetime_to_str(now))
        .bind(datetime_to_str(cutoff))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Prune old ledger rows.
    ///
    /// The newest `keep_last_n` rows are always kept, and so is every running
    /// row. Everything else older than `keep_days` is deleted.
    pub async fn cleanup_old(&self, keep_last_n: u32, keep_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(keep_days as i64);

        let result = sqlx::query(
            r#"
            DELETE FROM scan_runs
            WHERE status != 'running'
              AND job_id NOT IN (
                  SELECT job_id FROM scan_runs ORDER BY started_at DESC LIMIT ?1
              )
              AND started_at < ?2
            "#,
        )
        .bind(keep_last_n as i64)
        .bind(datetime_to_str(cutoff))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;
    use assert_matches::assert_matches;

    fn new_job(id: &str) -> CreateScanJob {
        CreateScanJob {
            job_id: id.to_string(),
            source: JobSource::Manual,
            log_path: format!("/tmp/scan_{}.log", id),
        }
    }

    async fn backdate(db: &crate::db::Database, job_id: &str, age: Duration) {
        sqlx::query("UPDATE scan_runs SET started_at = ?1 WHERE job_id = ?2")
            .bind(datetime_to_str(Utc::now() - age))
            .bind(job_id)
            .execute(db.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_only_one_running_job() {
        let (db, _dir) = temp_db().await;
        let repo = db.scan_jobs();

        let first = repo.create_if_idle(&new_job("a")).await.unwrap();
        assert_matches!(first, Some(ref job) if job.status == JobStatus::Running);
        assert!(repo.create_if_idle(&new_job("b")).await.unwrap().is_none());

        repo.finish("a", JobStatus::Success, None, None).await.unwrap();
        assert!(repo.create_if_idle(&new_job("b")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_terminal_status_is_absorbing() {
        let (db, _dir) = temp_db().await;
        let repo = db.scan_jobs();
        repo.create_if_idle(&new_job("a")).await.unwrap();

        let stats = serde_json::json!({"checked": 3});
        assert!(repo.finish("a", JobStatus::Cancelled, Some(&stats), None).await.unwrap());
        assert!(!repo.finish("a", JobStatus::Success, None, None).await.unwrap());

        let job = repo.get("a").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.stats, Some(stats));
        assert!(job.finished_at.is_some());
        assert!(repo.finish("a", JobStatus::Running, None, None).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_only_applies_to_running_jobs() {
        let (db, _dir) = temp_db().await;
        let repo = db.scan_jobs();
        repo.create_if_idle(&new_job("a")).await.unwrap();

        assert!(!repo.is_cancel_requested("a").await.unwrap());
        assert!(repo.request_cancel("a").await.unwrap());
        assert!(repo.is_cancel_requested("a").await.unwrap());

        repo.finish("a", JobStatus::Cancelled, None, None).await.unwrap();
        repo.create_if_idle(&new_job("b")).await.unwrap();
        repo.finish("b", JobStatus::Success, None, None).await.unwrap();
        assert!(!repo.request_cancel("b").await.unwrap());
        assert!(!repo.is_cancel_requested("b").await.unwrap());
        assert!(!repo.is_cancel_requested("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_orphan_recovery_respects_grace_window() {
        let (db, _dir) = temp_db().await;
        let repo = db.scan_jobs();
        repo.create_if_idle(&new_job("old")).await.unwrap();
        backdate(&db, "old", Duration::minutes(30)).await;

        let recovered = repo.mark_orphaned_interrupted(Duration::minutes(10)).await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, JobStatus::Interrupted);
        assert_eq!(
            recovered[0].error.as_deref(),
            Some("Process restarted (orphan recovery)")
        );

        // Exactly once
        assert!(repo.mark_orphaned_interrupted(Duration::minutes(10)).await.unwrap().is_empty());

        repo.create_if_idle(&new_job("young")).await.unwrap();
        backdate(&db, "young", Duration::minutes(2)).await;
        assert!(repo.mark_orphaned_interrupted(Duration::minutes(10)).await.unwrap().is_empty());
        assert_eq!(repo.get("young").await.unwrap().unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_and_running_rows() {
        let (db, _dir) = temp_db().await;
        let repo = db.scan_jobs();

        for (i, id) in ["j1", "j2", "j3", "j4"].iter().enumerate() {
            repo.create_if_idle(&new_job(id)).await.unwrap();
            repo.finish(id, JobStatus::Success, None, None).await.unwrap();
            backdate(&db, id, Duration::days(200 - i as i64)).await;
        }
        repo.create_if_idle(&new_job("live")).await.unwrap();
        backdate(&db, "live", Duration::days(365)).await;

        // The two newest finished rows are j4, j3. The live row is the oldest
        // but must survive regardless.
        let removed = repo.cleanup_old(2, 90).await.unwrap();
        assert_eq!(removed, 2);

        let mut remaining: Vec<_> = repo
            .list(10)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.job_id)
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec!["j3", "j4", "live"]);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("interrupted".parse::<JobStatus>().unwrap(), JobStatus::Interrupted);
        assert!("paused".parse::<JobStatus>().is_err());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }
}
