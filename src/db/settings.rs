//! Application settings database operations
//!
//! Settings are stored as JSON values in the `app_settings` key/value table.
//! The scan settings record lives under a single key and is always merged
//! over defaults on load, so a record written by an older version (or edited
//! by hand) never prevents a scan from starting.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db::sqlite_helpers::now_iso8601;

const SCAN_SETTINGS_KEY: &str = "scan_settings";
const LAST_RUN_DATE_KEY: &str = "last_run_date";

/// Default daily trigger time
pub const DEFAULT_SCHEDULE_TIME: &str = "04:00";

/// User-editable scan configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Library titles to scan
    pub libraries: Vec<String>,
    /// Lookback window for the recency cutoff
    pub days: i64,
    /// Per-library cap on the number of newest items fetched
    pub max_items: u32,
    /// Record what would be fixed without sending refresh requests
    pub dry_run: bool,
    pub schedule_active: bool,
    /// Daily trigger time, `HH:MM` local time
    pub schedule_time: String,
    pub refresh_wait_total_seconds: u64,
    pub refresh_wait_interval_seconds: u64,
    /// Number of previously failed items re-checked regardless of age
    pub failed_retry_pool_limit: u32,
    pub failed_backoff_hours: i64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            libraries: Vec::new(),
            days: 30,
            max_items: 50,
            dry_run: false,
            schedule_active: false,
            schedule_time: DEFAULT_SCHEDULE_TIME.to_string(),
            refresh_wait_total_seconds: 20,
            refresh_wait_interval_seconds: 4,
            failed_retry_pool_limit: 50,
            failed_backoff_hours: 24,
        }
    }
}

/// Settings repository for database operations
pub struct SettingsRepository {
    pool: SqlitePool,
}

impl SettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the raw JSON text stored under a key
    pub async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let value: Option<(String,)> =
            sqlx::query_as("SELECT value FROM app_settings WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value.map(|(v,)| v))
    }

    /// Get a setting value as a specific type
    pub async fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key).await? {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw)
                    .with_context(|| format!("Setting '{}' holds invalid JSON", key))?,
            )),
            None => Ok(None),
        }
    }

    /// Set a setting value
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json_value = serde_json::to_string(value)?;

        sqlx::query(
            r#"
            INSERT INTO app_settings (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(&json_value)
        .bind(now_iso8601())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete a setting
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM app_settings WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Load the scan settings, falling back to defaults for anything missing
    /// or unreadable
    pub async fn load_scan_settings(&self) -> Result<ScanSettings> {
        let Some(raw) = self.get_raw(SCAN_SETTINGS_KEY).await? else {
            return Ok(ScanSettings::default());
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(stored) => Ok(merge_over_defaults(stored)),
            Err(e) => {
                warn!(error = %e, "Stored scan settings are not valid JSON, using defaults");
                Ok(ScanSettings::default())
            }
        }
    }

    pub async fn save_scan_settings(&self, settings: &ScanSettings) -> Result<()> {
        self.set(SCAN_SETTINGS_KEY, settings).await
    }

    pub async fn has_scan_settings(&self) -> Result<bool> {
        Ok(self.get_raw(SCAN_SETTINGS_KEY).await?.is_some())
    }

    /// Date of the last scheduled scan
    pub async fn last_run_date(&self) -> Result<Option<NaiveDate>> {
        match self.get_value::<String>(LAST_RUN_DATE_KEY).await {
            Ok(Some(s)) => Ok(NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(error = %e, "Stored last run date is unreadable, ignoring");
                Ok(None)
            }
        }
    }

    pub async fn set_last_run_date(&self, date: NaiveDate) -> Result<()> {
        self.set(LAST_RUN_DATE_KEY, &date.format("%Y-%m-%d").to_string())
            .await
    }

    /// Import a legacy `settings.json` file when the store holds no scan
    /// settings yet. Returns whether anything was imported.
    pub async fn import_legacy_settings(&self, path: &Path) -> Result<bool> {
        if self.has_scan_settings().await? {
            return Ok(false);
        }

        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read legacy settings file");
                return Ok(false);
            }
        };

        let settings = match serde_json::from_str::<Value>(&raw) {
            Ok(stored) => merge_over_defaults(stored),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Legacy settings file is malformed, skipping import");
                return Ok(false);
            }
        };

        self.save_scan_settings(&settings).await?;
        info!(path = %path.display(), libraries = settings.libraries.len(), "Imported legacy settings");
        Ok(true)
    }
}

/// Overlay a stored record onto the defaults one key at a time.
///
/// A key whose value does not decode into its field is dropped with a
/// warning and the rest of the record still applies. Numeric strings are
/// accepted for numeric fields. Unknown keys are ignored.
fn merge_over_defaults(stored: Value) -> ScanSettings {
    let defaults = ScanSettings::default();
    let Value::Object(stored) = stored else {
        warn!("Stored scan settings are not a JSON object, using defaults");
        return defaults;
    };
    let Ok(Value::Object(mut merged)) = serde_json::to_value(&defaults) else {
        return defaults;
    };

    for (key, value) in stored {
        let Some(default_value) = merged.get(&key) else {
            continue;
        };
        let value = coerce_numeric(default_value, value);

        let mut candidate = merged.clone();
        candidate.insert(key.clone(), value);
        match serde_json::from_value::<ScanSettings>(Value::Object(candidate.clone())) {
            Ok(_) => merged = candidate,
            Err(e) => warn!(key = %key, error = %e, "Ignoring malformed scan setting"),
        }
    }

    serde_json::from_value(Value::Object(merged)).unwrap_or(defaults)
}

fn coerce_numeric(default_value: &Value, value: Value) -> Value {
    if let (Value::String(s), Value::Number(_)) = (&value, default_value) {
        if let Ok(n) = s.trim().parse::<i64>() {
            return Value::from(n);
        }
    }
    value
}
