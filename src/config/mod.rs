//! Application configuration management

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use crate::jobs::CoordinatorConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite state store path
    pub database_path: PathBuf,

    /// Directory holding per-job log files
    pub job_log_dir: PathBuf,

    /// Legacy settings.json imported once into the store
    pub settings_path: PathBuf,

    /// Plex server base URL
    pub plex_url: Option<String>,

    /// Plex auth token
    pub plex_token: Option<String>,

    /// Per-request timeout for Plex calls
    pub plex_timeout: Duration,

    /// Running jobs younger than this survive orphan recovery
    pub orphan_grace_minutes: i64,

    pub log_retention_days: u32,
    pub scan_run_retention_count: u32,
    pub scan_run_retention_days: u32,

    /// How often the scheduler checks the clock
    pub scheduler_poll: Duration,

    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./data/refresh_state.db".to_string())
                .into(),

            job_log_dir: env::var("JOB_LOG_DIR")
                .unwrap_or_else(|_| "./data/logs".to_string())
                .into(),

            settings_path: env::var("SETTINGS_PATH")
                .unwrap_or_else(|_| "./data/settings.json".to_string())
                .into(),

            plex_url: non_empty_var("PLEX_URL"),
            plex_token: non_empty_var("PLEX_TOKEN"),

            plex_timeout: Duration::from_secs(parse_var("PLEX_TIMEOUT", 60u64)),

            orphan_grace_minutes: parse_var("ORPHAN_GRACE_MINUTES", 10i64).max(0),

            log_retention_days: parse_var("LOG_RETENTION_DAYS", 30),
            scan_run_retention_count: parse_var("SCAN_RUN_RETENTION_COUNT", 500),
            scan_run_retention_days: parse_var("SCAN_RUN_RETENTION_DAYS", 90),

            scheduler_poll: Duration::from_secs(parse_var("SCHEDULER_POLL_SECONDS", 30u64).max(1)),

            telegram_bot_token: non_empty_var("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: non_empty_var("TELEGRAM_CHAT_ID"),
        })
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            log_dir: self.job_log_dir.clone(),
            orphan_grace: chrono::Duration::minutes(self.orphan_grace_minutes),
            log_retention_days: self.log_retention_days,
            run_retention_count: self.scan_run_retention_count,
            run_retention_days: self.scan_run_retention_days,
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: FromStr + std::fmt::Display + Copy>(name: &str, default: T) -> T {
    parse_or(name, env::var(name).ok().as_deref(), default)
}

fn parse_or<T: FromStr + std::fmt::Display + Copy>(name: &str, raw: Option<&str>, default: T) -> T {
    match raw.map(str::trim) {
        None | Some("") => default,
        Some(value) => value.parse().unwrap_or_else(|_| {
            warn!(var = name, value, default = %default, "Invalid value, using default");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_or_falls_back_on_bad_input() {
        assert_eq!(parse_or("PLEX_TIMEOUT", Some("15"), 60u64), 15);
        assert_eq!(parse_or("PLEX_TIMEOUT", Some(" 15 "), 60u64), 15);
        assert_eq!(parse_or("PLEX_TIMEOUT", Some("soon"), 60u64), 60);
        assert_eq!(parse_or("PLEX_TIMEOUT", Some(""), 60u64), 60);
        assert_eq!(parse_or("PLEX_TIMEOUT", None, 60u64), 60);
        assert_eq!(parse_or("LOG_RETENTION_DAYS", Some("-1"), 30u32), 30);
    }

    #[test]
    fn test_coordinator_config_uses_values() {
        let config = Config {
            database_path: "db".into(),
            job_log_dir: "logs".into(),
            settings_path: "settings.json".into(),
            plex_url: None,
            plex_token: None,
            plex_timeout: Duration::from_secs(60),
            orphan_grace_minutes: 3,
            log_retention_days: 7,
            scan_run_retention_count: 20,
            scan_run_retention_days: 14,
            scheduler_poll: Duration::from_secs(30),
            telegram_bot_token: None,
            telegram_chat_id: None,
        };
        let coordinator = config.coordinator_config();
        assert_eq!(coordinator.log_dir, PathBuf::from("logs"));
        assert_eq!(coordinator.orphan_grace, chrono::Duration::minutes(3));
        assert_eq!(coordinator.run_retention_count, 20);
    }
}
