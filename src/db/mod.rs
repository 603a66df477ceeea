//! Database connection and operations
//!
//! A single local SQLite file holds settings, per-item outcome history and
//! the scan job ledger. The file is opened in WAL mode with a busy timeout so
//! the scan engine's writes and the coordinator's ledger reads can interleave.

pub mod media_state;
pub mod scan_jobs;
pub mod schema_sync;
pub mod settings;
pub mod sqlite_helpers;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

pub use media_state::{ItemState, MediaStateRecord, MediaStateRepository, MediaStateTotals, UpsertMediaState};
pub use scan_jobs::{CreateScanJob, JobSource, JobStatus, ScanJobRecord, ScanJobRepository};
pub use settings::{ScanSettings, SettingsRepository};

/// Database wrapper providing connection pool access
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database wrapper from an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the maximum connection pool size from environment or default
    fn get_max_connections() -> u32 {
        std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5)
    }

    /// Open (creating if needed) the database file and sync its schema
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(Self::get_max_connections())
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {}", path.display()))?;

        let db = Self { pool };
        db.migrate().await?;

        info!(service = "database", path = %path.display(), "Database ready");
        Ok(db)
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get a settings repository
    pub fn settings(&self) -> SettingsRepository {
        SettingsRepository::new(self.pool.clone())
    }

    /// Get a media state repository
    pub fn media_state(&self) -> MediaStateRepository {
        MediaStateRepository::new(self.pool.clone())
    }

    /// Get a scan job ledger repository
    pub fn scan_jobs(&self) -> ScanJobRepository {
        ScanJobRepository::new(self.pool.clone())
    }

    /// Create missing tables and columns
    pub async fn migrate(&self) -> Result<()> {
        let result = schema_sync::sync_schema(&self.pool)
            .await
            .context("Schema sync failed")?;
        if let Some(first) = result.errors.first() {
            anyhow::bail!("Schema sync reported {} error(s): {}", result.errors.len(), first);
        }
        Ok(())
    }
}
