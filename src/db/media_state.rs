//! Per-item outcome history
//!
//! One row per remote item, keyed by its rating key. Every scan that
//! classifies an item upserts its row; rows are never deleted.

use std::fmt;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db::sqlite_helpers::{now_iso8601, str_to_datetime_lenient};

/// Last known outcome for an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Fixed,
    Failed,
    DryRun,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Fixed => "fixed",
            ItemState::Failed => "failed",
            ItemState::DryRun => "dry_run",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fixed" => Some(ItemState::Fixed),
            "failed" => Some(ItemState::Failed),
            "dry_run" => Some(ItemState::DryRun),
            _ => None,
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A media state row
#[derive(Debug, Clone, PartialEq)]
pub struct MediaStateRecord {
    pub rating_key: String,
    pub library: Option<String>,
    pub title: Option<String>,
    /// `None` when the stored value is not a recognised state
    pub state: Option<ItemState>,
    pub note: Option<String>,
    /// `None` when missing or unparseable
    pub last_scan: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for MediaStateRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use sqlx::Row;

        let state: Option<String> = row.try_get("state")?;
        let last_scan: Option<String> = row.try_get("last_scan")?;
        let updated_at: Option<String> = row.try_get("updated_at")?;

        Ok(Self {
            rating_key: row.try_get("rating_key")?,
            library: row.try_get("library")?,
            title: row.try_get("title")?,
            state: state.as_deref().and_then(ItemState::parse),
            note: row.try_get("note")?,
            last_scan: str_to_datetime_lenient(last_scan.as_deref()),
            updated_at: str_to_datetime_lenient(updated_at.as_deref()),
        })
    }
}

/// Input for recording an outcome
#[derive(Debug, Clone)]
pub struct UpsertMediaState<'a> {
    pub rating_key: &'a str,
    pub library: &'a str,
    pub title: &'a str,
    pub state: ItemState,
    pub note: &'a str,
}

/// Aggregate counts over the whole history
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MediaStateTotals {
    pub checked: i64,
    pub fixed: i64,
    pub failed: i64,
    pub dry_run: i64,
}

impl MediaStateTotals {
    /// Share of remediation attempts that succeeded, in percent
    pub fn success_rate(&self) -> f64 {
        let attempted = self.fixed + self.failed;
        if attempted == 0 {
            0.0
        } else {
            self.fixed as f64 / attempted as f64 * 100.0
        }
    }
}

pub struct MediaStateRepository {
    pool: SqlitePool,
}

impl MediaStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or overwrite the outcome for an item
    pub async fn upsert(&self, input: &UpsertMediaState<'_>) -> Result<()> {
        let now = now_iso8601();

        sqlx::query(
            r#"
            INSERT INTO media_state (rating_key, library, title, updated_at, state, note, last_scan)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?4)
            ON CONFLICT (rating_key) DO UPDATE SET
                library = excluded.library,
                title = excluded.title,
                updated_at = excluded.updated_at,
                state = excluded.state,
                note = excluded.note,
                last_scan = excluded.last_scan
            "#,
        )
        .bind(input.rating_key)
        .bind(input.library)
        .bind(sanitize_text(input.title))
        .bind(&now)
        .bind(input.state.as_str())
        .bind(sanitize_text(input.note))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, rating_key: &str) -> Result<Option<MediaStateRecord>> {
        let record = sqlx::query_as::<_, MediaStateRecord>(
            "SELECT * FROM media_state WHERE rating_key = ?1",
        )
        .bind(rating_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Most recently failed items in the given libraries, newest first.
    /// Rows without a stored library are included; the caller resolves them.
    pub async fn recent_failed(&self, limit: u32, libraries: &[String]) -> Result<Vec<MediaStateRecord>> {
        let libraries = serde_json::to_string(libraries)?;
        let records = sqlx::query_as::<_, MediaStateRecord>(
            r#"
            SELECT * FROM media_state
            WHERE state = 'failed'
              AND (library IS NULL OR library = ''
                   OR library IN (SELECT value FROM json_each(?2)))
            ORDER BY last_scan DESC
            LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .bind(libraries)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Latest outcomes, optionally restricted to one state
    pub async fn recent(&self, limit: u32, state: Option<ItemState>) -> Result<Vec<MediaStateRecord>> {
        let records = match state {
            Some(state) => {
                sqlx::query_as::<_, MediaStateRecord>(
                    "SELECT * FROM media_state WHERE state = ?1 ORDER BY last_scan DESC LIMIT ?2",
                )
                .bind(state.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, MediaStateRecord>(
                    "SELECT * FROM media_state ORDER BY last_scan DESC LIMIT ?1",
                )
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(records)
    }

    pub async fn totals(&self) -> Result<MediaStateTotals> {
        let (checked, fixed, failed, dry_run): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN state = 'fixed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'failed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'dry_run' THEN 1 ELSE 0 END), 0)
            FROM media_state
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(MediaStateTotals {
            checked,
            fixed,
            failed,
            dry_run,
        })
    }
}

/// Strip control characters that titles scraped from agents occasionally carry
fn sanitize_text(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_control() || *c == '\t')
        .collect()
}
