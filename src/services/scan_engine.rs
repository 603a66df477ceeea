//! Three-phase scan pipeline
//!
//! 1. Collect: newest items of every configured library, plus a retry pool
//!    of recently failed items that bypasses the recency cutoff.
//! 2. Analyze: apply the cutoff, classify, record dry-run hits, and apply
//!    the failure backoff.
//! 3. Remediate: sequentially attempt a fix for each queued item, each
//!    attempt isolated so a panic cannot take down the batch.
//!
//! Progress is broadcast to subscribers: phases 1 and 2 cover the first 30%,
//! phase 3 the remaining 70%.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::db::{Database, ItemState, ScanSettings, UpsertMediaState};

use super::cancel::CancelSignal;
use super::connection::ConnectionManager;
use super::job_log::JobLog;
use super::media_server::{MediaItem, MediaServer};
use super::notifications::ScanNotifier;
use super::refresh_policy::{FixOutcome, RefreshPolicy, backoff_remaining, needs_attention};

/// Title recorded for items whose processing crashed
pub const ERROR_ITEM_TITLE: &str = "ERROR_ITEM";

const ANALYZE_SHARE: f64 = 0.3;

/// Aggregate result of one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    pub checked: u32,
    pub fixed: u32,
    pub would_fix: u32,
    pub failed: u32,
}

impl ScanStats {
    /// `fixed / (fixed + failed)` in percent, `None` when nothing was attempted
    pub fn success_rate(&self) -> Option<f64> {
        let attempted = self.fixed + self.failed;
        (attempted > 0).then(|| f64::from(self.fixed) / f64::from(attempted) * 100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Collect,
    Analyze,
    Remediate,
    Done,
}

/// Scan progress event
#[derive(Debug, Clone, Serialize)]
pub struct ScanProgress {
    pub phase: ScanPhase,
    /// 0.0 to 1.0
    pub fraction: f64,
    pub message: String,
}

#[derive(Debug)]
struct Candidate {
    item: MediaItem,
    library: String,
    /// Retry-pool items are exempt from the recency cutoff
    from_retry_pool: bool,
}

/// A library and the items collected for it, in configured order
type LibraryBatch = (String, Vec<Candidate>);

pub struct ScanEngine {
    db: Database,
    connections: Arc<ConnectionManager>,
    notifier: Arc<dyn ScanNotifier>,
    progress_tx: broadcast::Sender<ScanProgress>,
}

impl ScanEngine {
    pub fn new(db: Database, connections: Arc<ConnectionManager>, notifier: Arc<dyn ScanNotifier>) -> Self {
        let (progress_tx, _) = broadcast::channel(100);
        Self {
            db,
            connections,
            notifier,
            progress_tx,
        }
    }

    /// Subscribe to scan progress updates
    pub fn subscribe(&self) -> broadcast::Receiver<ScanProgress> {
        self.progress_tx.subscribe()
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    fn progress(&self, phase: ScanPhase, fraction: f64, message: impl Into<String>) {
        let _ = self.progress_tx.send(ScanProgress {
            phase,
            fraction: fraction.clamp(0.0, 1.0),
            message: message.into(),
        });
    }

    async fn record(&self, log: &JobLog, candidate: &Candidate, title: &str, state: ItemState, note: &str) {
        let result = self
            .db
            .media_state()
            .upsert(&UpsertMediaState {
                rating_key: &candidate.item.rating_key,
                library: &candidate.library,
                title,
                state,
                note,
            })
            .await;

        if let Err(e) = result {
            warn!(rating_key = %candidate.item.rating_key, error = %e, "Failed to record item outcome");
            log.line(format!("Could not save result for {}: {}", title, e)).await;
        }
    }

    /// Run one scan.
    ///
    /// Returns `None` if the media server could not be reached at all. A
    /// cancelled scan returns the statistics gathered so far.
    pub async fn run(&self, settings: &ScanSettings, log: &JobLog, cancel: &dyn CancelSignal) -> Option<ScanStats> {
        log.line("Starting scan...").await;

        let server = match self.connections.get_connection(false).await {
            Ok(server) => server,
            Err(e) => {
                log.line(format!("Connection error: {}", e)).await;
                return None;
            }
        };

        let mut stats = ScanStats::default();

        let batches = self.collect(server.as_ref(), settings, log, cancel).await;
        let queue = self.analyze(batches, settings, log, cancel, &mut stats).await;
        if !queue.is_empty() && !settings.dry_run {
            self.remediate(server.as_ref(), queue, settings, log, cancel, &mut stats)
                .await;
        }

        self.progress(ScanPhase::Done, 1.0, "Done");
        log.line(format!(
            "Done. checked={} fixed={} would_fix={} failed={}",
            stats.checked, stats.fixed, stats.would_fix, stats.failed
        ))
        .await;

        // Delivery must not hold up job completion
        if stats.checked > 0 {
            let notifier = Arc::clone(&self.notifier);
            tokio::spawn(async move {
                if let Err(e) = notifier.scan_completed(&stats).await {
                    warn!(error = %e, "Scan notification failed");
                }
            });
        }

        Some(stats)
    }

    /// Phase 1
    async fn collect(
        &self,
        server: &dyn MediaServer,
        settings: &ScanSettings,
        log: &JobLog,
        cancel: &dyn CancelSignal,
    ) -> Vec<LibraryBatch> {
        log.line("Phase 1: collecting items...").await;
        self.progress(ScanPhase::Collect, 0.0, "Collecting items");

        let mut batches: Vec<LibraryBatch> = Vec::new();
        for library in &settings.libraries {
            if cancel.is_cancelled().await {
                log.line("Scan cancelled").await;
                return batches;
            }

            match server.recent_items(library, settings.max_items).await {
                Ok(items) => {
                    let candidates = items
                        .into_iter()
                        .map(|item| Candidate {
                            item,
                            library: library.clone(),
                            from_retry_pool: false,
                        })
                        .collect();
                    batches.push((library.clone(), candidates));
                }
                Err(e) => log.line(format!("Failed to load {}: {}", library, e)).await,
            }
        }

        if settings.failed_retry_pool_limit > 0 && !cancel.is_cancelled().await {
            self.add_retry_pool(server, settings, log, &mut batches).await;
        }

        batches
    }

    /// Re-check recently failed items regardless of their age, so the
    /// recency cutoff cannot starve them
    async fn add_retry_pool(
        &self,
        server: &dyn MediaServer,
        settings: &ScanSettings,
        log: &JobLog,
        batches: &mut Vec<LibraryBatch>,
    ) {
        let limit = settings.failed_retry_pool_limit;
        let rows = match self.db.media_state().recent_failed(limit, &settings.libraries).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "Could not load retry pool");
                return;
            }
        };

        let mut seen: HashSet<String> = batches
            .iter()
            .flat_map(|(_, items)| items.iter().map(|c| c.item.rating_key.clone()))
            .collect();
        let configured = |name: &str| settings.libraries.iter().any(|l| l == name);

        let mut added = 0;
        for row in rows {
            let stored_library = row.library.filter(|l| !l.is_empty());
            if stored_library.as_deref().is_some_and(|l| !configured(l)) {
                continue;
            }
            if seen.contains(&row.rating_key) {
                continue;
            }

            let item = match server.fetch_item(&row.rating_key).await {
                Ok(item) => item,
                Err(e) => {
                    warn!(rating_key = %row.rating_key, error = %e, "Retry pool item unavailable");
                    continue;
                }
            };

            let library = stored_library
                .or_else(|| item.library.clone())
                .unwrap_or_else(|| "Unknown".to_string());
            if !configured(&library) {
                continue;
            }

            seen.insert(row.rating_key);
            let candidate = Candidate {
                item,
                library: library.clone(),
                from_retry_pool: true,
            };
            match batches.iter_mut().find(|(name, _)| *name == library) {
                Some((_, items)) => items.push(candidate),
                None => batches.push((library, vec![candidate])),
            }
            added += 1;
        }

        if added > 0 {
            log.line(format!(
                "Retry pool: +{} failed items added from history (limit={})",
                added, limit
            ))
            .await;
        }

        // Keep the configured library order
        batches.sort_by_key(|(name, _)| {
            settings
                .libraries
                .iter()
                .position(|l| l == name)
                .unwrap_or(usize::MAX)
        });
    }

    /// Phase 2. Returns the items queued for remediation.
    async fn analyze(
        &self,
        batches: Vec<LibraryBatch>,
        settings: &ScanSettings,
        log: &JobLog,
        cancel: &dyn CancelSignal,
        stats: &mut ScanStats,
    ) -> Vec<Candidate> {
        log.line("Phase 2: analyzing items...").await;

        let total: usize = batches.iter().map(|(_, items)| items.len()).sum();
        let days = chrono::Duration::try_days(settings.days).unwrap_or(chrono::Duration::days(30));
        let cutoff = Utc::now() - days;
        let backoff = chrono::Duration::try_hours(settings.failed_backoff_hours)
            .unwrap_or(chrono::Duration::hours(24));

        let mut processed = 0usize;
        let mut queue = Vec::new();

        'libraries: for (library, items) in batches {
            if cancel.is_cancelled().await {
                log.line("Scan cancelled").await;
                break;
            }
            log.line(format!("Analyzing: {}", library)).await;

            for candidate in items {
                if cancel.is_cancelled().await {
                    log.line("Scan cancelled").await;
                    break 'libraries;
                }

                processed += 1;
                let title = candidate.item.title.clone();
                self.progress(
                    ScanPhase::Analyze,
                    processed as f64 / total as f64 * ANALYZE_SHARE,
                    format!("Analyzing: {} ({}/{})", title, processed, total),
                );

                let Some(reference) = candidate.item.reference_time() else {
                    log.line(format!("{}: addedAt/updatedAt missing, skipped", title)).await;
                    continue;
                };
                if !candidate.from_retry_pool && reference < cutoff {
                    continue;
                }

                stats.checked += 1;
                if !needs_attention(&candidate.item) {
                    continue;
                }

                if settings.dry_run {
                    log.line(format!("-> [DRY RUN] would fix: {}", title)).await;
                    self.record(log, &candidate, &title, ItemState::DryRun, "Simulation")
                        .await;
                    stats.would_fix += 1;
                    continue;
                }

                match self.db.media_state().get(&candidate.item.rating_key).await {
                    Ok(Some(previous)) => {
                        let now = Utc::now();
                        if let Some(remaining) =
                            backoff_remaining(previous.state, previous.last_scan, now, backoff)
                        {
                            let age = previous
                                .last_scan
                                .map(|t| now.signed_duration_since(t).num_minutes())
                                .unwrap_or_default();
                            log.line(format!(
                                "Backoff: {} (failed {} min ago), skipping for ~{} min",
                                title,
                                age,
                                remaining.num_minutes()
                            ))
                            .await;
                            continue;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(rating_key = %candidate.item.rating_key, error = %e, "Could not read item history");
                    }
                }

                queue.push(candidate);
            }
        }

        queue
    }

    /// Phase 3
    async fn remediate(
        &self,
        server: &dyn MediaServer,
        queue: Vec<Candidate>,
        settings: &ScanSettings,
        log: &JobLog,
        cancel: &dyn CancelSignal,
        stats: &mut ScanStats,
    ) {
        let policy = RefreshPolicy::from_seconds(
            settings.refresh_wait_total_seconds,
            settings.refresh_wait_interval_seconds,
        );
        let total = queue.len();
        log.line(format!("Phase 3: fixing {} items...", total)).await;

        for (idx, candidate) in queue.iter().enumerate() {
            if cancel.is_cancelled().await {
                log.line("Scan cancelled").await;
                break;
            }

            let title = &candidate.item.title;
            log.line(format!("-> Fixing ({}/{}): {}...", idx + 1, total, title)).await;
            self.progress(
                ScanPhase::Remediate,
                ANALYZE_SHARE + (idx + 1) as f64 / total as f64 * (1.0 - ANALYZE_SHARE),
                format!("Fixing {}/{}: {}", idx + 1, total, title),
            );

            let attempt = AssertUnwindSafe(policy.attempt_fix(server, &candidate.item, cancel))
                .catch_unwind()
                .await;

            match attempt {
                Ok(FixOutcome::Fixed(msg)) => {
                    log.line(format!("OK {}: {}", title, msg)).await;
                    self.record(log, candidate, title, ItemState::Fixed, &msg).await;
                    stats.fixed += 1;
                }
                Ok(FixOutcome::Failed(msg)) => {
                    log.line(format!("FAILED {}: {}", title, msg)).await;
                    self.record(log, candidate, title, ItemState::Failed, &msg).await;
                    stats.failed += 1;
                }
                Ok(FixOutcome::Cancelled) => {
                    log.line(format!("Scan cancelled while fixing {}, not recorded", title)).await;
                    break;
                }
                Err(panic) => {
                    let msg = panic_message(panic.as_ref());
                    error!(rating_key = %candidate.item.rating_key, error = %msg, "Item processing crashed");
                    log.line(format!("Skipping broken item: {}", msg)).await;
                    self.record(log, candidate, ERROR_ITEM_TITLE, ItemState::Failed, &msg)
                        .await;
                    stats.failed += 1;
                }
            }
        }
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate() {
        let stats = ScanStats {
            checked: 5,
            fixed: 3,
            would_fix: 0,
            failed: 1,
        };
        assert_eq!(stats.success_rate(), Some(75.0));
        assert_eq!(ScanStats::default().success_rate(), None);
    }

    #[test]
    fn test_stats_serialize_with_all_counters() {
        let json = serde_json::to_value(ScanStats::default()).unwrap();
        for key in ["checked", "fixed", "would_fix", "failed"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
