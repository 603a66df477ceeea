//! Append-only per-job log files
//!
//! Each scan job owns a plain text file of timestamped lines
//! (`YYYY-MM-DD HH:MM:SS message`). Every line is mirrored into tracing so
//! the structured log carries the same narrative.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::Local;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{info, warn};

/// Initial trailing window read when tailing
const TAIL_INITIAL_WINDOW: u64 = 64 * 1024;
/// Upper bound on the trailing window, whatever the requested line count
const TAIL_MAX_WINDOW: u64 = 8 * 1024 * 1024;

/// Log file name for a job
pub fn log_file_name(job_id: &str) -> String {
    format!("scan_{}.log", job_id)
}

/// Append one timestamped line to a log file, creating it if needed
pub async fn append_line(path: &Path, message: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }

    let line = format!("{} {}\n", Local::now().format("%Y-%m-%d %H:%M:%S"), message);
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open log {}", path.display()))?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Writer for one job's log
pub struct JobLog {
    job_id: Option<String>,
    path: Option<PathBuf>,
    write_failed: AtomicBool,
}

impl JobLog {
    pub fn new(job_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            path: Some(path.into()),
            write_failed: AtomicBool::new(false),
        }
    }

    /// A log that only goes to tracing
    pub fn detached() -> Self {
        Self {
            job_id: None,
            path: None,
            write_failed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record a line. File errors are reported once and otherwise ignored.
    pub async fn line(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!(job = "scan", job_id = self.job_id.as_deref().unwrap_or("-"), "{}", message);

        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = append_line(path, message).await {
            if !self.write_failed.swap(true, Ordering::SeqCst) {
                warn!(path = %path.display(), error = %e, "Could not write job log");
            }
        }
    }
}

/// Last `lines` lines of a log file.
///
/// Reads a trailing window that doubles until it holds enough lines or hits
/// [`TAIL_MAX_WINDOW`]; the file is never read in full. Invalid UTF-8 is
/// replaced. A missing file yields an empty string.
pub async fn tail_file(path: &Path, lines: usize) -> Result<String> {
    if lines == 0 {
        return Ok(String::new());
    }

    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to open log {}", path.display())),
    };
    let len = file.metadata().await?.len();

    let mut window = TAIL_INITIAL_WINDOW.min(len);
    let mut buf = Vec::new();
    loop {
        let start = len - window;
        file.seek(SeekFrom::Start(start)).await?;
        buf.clear();
        (&mut file).take(window).read_to_end(&mut buf).await?;

        let newlines = buf.iter().filter(|b| **b == b'\n').count();
        if newlines > lines || start == 0 || window >= TAIL_MAX_WINDOW {
            if start > 0 {
                // Drop the partial first line
                match buf.iter().position(|b| *b == b'\n') {
                    Some(pos) => {
                        buf.drain(..=pos);
                    }
                    None => buf.clear(),
                }
            }
            break;
        }
        window = (window * 2).min(len).min(TAIL_MAX_WINDOW);
    }

    let text = String::from_utf8_lossy(&buf);
    let all: Vec<&str> = text.lines().collect();
    let skip = all.len().saturating_sub(lines);
    Ok(all[skip..].join("\n"))
}

/// Delete `scan_*.log` files in `dir` last modified more than `keep_days` ago
pub async fn cleanup_old_logs(dir: &Path, keep_days: u32) -> Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
    };

    let max_age = Duration::from_secs(u64::from(keep_days) * 86_400);
    let now = SystemTime::now();
    let mut removed = 0;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with("scan_") && name.ends_with(".log")) {
            continue;
        }

        let expired = match entry.metadata().await.and_then(|m| m.modified()) {
            Ok(modified) => now.duration_since(modified).is_ok_and(|age| age > max_age),
            Err(_) => false,
        };
        if expired && tokio::fs::remove_file(entry.path()).await.is_ok() {
            removed += 1;
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_lines_are_timestamped_and_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join(log_file_name("abc"));
        let log = JobLog::new("abc", &path);

        log.line("first").await;
        log.line("second").await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" first"));
        // "YYYY-MM-DD HH:MM:SS " prefix
        assert_eq!(lines[1].len(), 20 + "second".len());
    }

    #[tokio::test]
    async fn test_tail_returns_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan_x.log");
        let body: String = (1..=10).map(|i| format!("line {}\n", i)).collect();
        tokio::fs::write(&path, body).await.unwrap();

        assert_eq!(tail_file(&path, 3).await.unwrap(), "line 8\nline 9\nline 10");
        assert_eq!(tail_file(&path, 100).await.unwrap().lines().count(), 10);
        assert_eq!(tail_file(&path, 0).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_tail_of_large_file_reads_trailing_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan_big.log");
        let body: String = (0..20_000).map(|i| format!("entry number {:06}\n", i)).collect();
        tokio::fs::write(&path, body).await.unwrap();

        let tail = tail_file(&path, 2).await.unwrap();
        assert_eq!(tail, "entry number 019998\nentry number 019999");

        // More lines than the initial window holds
        let tail = tail_file(&path, 5_000).await.unwrap();
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), 5_000);
        assert_eq!(lines[0], "entry number 015000");
    }

    #[tokio::test]
    async fn test_tail_tolerates_invalid_utf8_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan_bad.log");
        tokio::fs::write(&path, b"ok\nbad \xff byte\n").await.unwrap();

        let tail = tail_file(&path, 5).await.unwrap();
        assert!(tail.starts_with("ok\nbad "));
        assert!(tail.contains('\u{FFFD}'));

        assert_eq!(tail_file(&dir.path().join("nope.log"), 5).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_cleanup_only_touches_expired_scan_logs() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("scan_new.log"), "x").await.unwrap();
        tokio::fs::write(dir.path().join("other.txt"), "x").await.unwrap();

        // Nothing is older than a day
        assert_eq!(cleanup_old_logs(dir.path(), 1).await.unwrap(), 0);
        // Zero-day retention still requires a strictly positive age
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cleanup_old_logs(dir.path(), 0).await.unwrap(), 1);
        assert!(dir.path().join("other.txt").exists());

        assert_eq!(cleanup_old_logs(&dir.path().join("missing"), 30).await.unwrap(), 0);
    }
}
