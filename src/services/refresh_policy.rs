//! Classification and remediation of items with incomplete metadata

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::cancel::CancelSignal;
use super::media_server::{MediaItem, MediaServer};
use crate::db::ItemState;

pub const DEFAULT_WAIT_TOTAL: Duration = Duration::from_secs(20);
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_secs(4);

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|v| v.trim().is_empty())
}

/// True if the item lacks external ids, artwork or a summary
pub fn needs_attention(item: &MediaItem) -> bool {
    item.guids.iter().all(|g| g.trim().is_empty()) || is_blank(&item.thumb) || is_blank(&item.summary)
}

/// How much of the failure backoff is still left for an item.
///
/// Returns `None` when the item may be retried now: it did not fail last
/// time, its timestamp is unknown, or the backoff has elapsed.
pub fn backoff_remaining(
    last_state: Option<ItemState>,
    last_scan: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    backoff: chrono::Duration,
) -> Option<chrono::Duration> {
    if last_state != Some(ItemState::Failed) {
        return None;
    }
    let age = now.signed_duration_since(last_scan?);
    if age < backoff {
        Some(backoff - age)
    } else {
        None
    }
}

/// Result of one remediation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixOutcome {
    Fixed(String),
    Failed(String),
    /// Cancellation was observed before the attempt finished
    Cancelled,
}

/// Bounded polling budget for a remediation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    wait_total: Duration,
    wait_interval: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            wait_total: DEFAULT_WAIT_TOTAL,
            wait_interval: DEFAULT_WAIT_INTERVAL,
        }
    }
}

impl RefreshPolicy {
    /// Zero durations fall back to the defaults
    pub fn new(wait_total: Duration, wait_interval: Duration) -> Self {
        Self {
            wait_total: if wait_total.is_zero() { DEFAULT_WAIT_TOTAL } else { wait_total },
            wait_interval: if wait_interval.is_zero() { DEFAULT_WAIT_INTERVAL } else { wait_interval },
        }
    }

    pub fn from_seconds(wait_total: u64, wait_interval: u64) -> Self {
        Self::new(Duration::from_secs(wait_total), Duration::from_secs(wait_interval))
    }

    pub fn wait_total(&self) -> Duration {
        self.wait_total
    }

    /// Number of polls, `ceil(total / interval)` and at least one
    pub fn max_attempts(&self) -> u32 {
        let total = self.wait_total.as_nanos();
        let interval = self.wait_interval.as_nanos();
        let attempts = total.div_ceil(interval).max(1);
        u32::try_from(attempts).unwrap_or(u32::MAX)
    }

    /// Request a refresh and poll until the item looks complete or the
    /// budget is spent
    pub async fn attempt_fix(
        &self,
        server: &dyn MediaServer,
        item: &MediaItem,
        cancel: &dyn CancelSignal,
    ) -> FixOutcome {
        if cancel.is_cancelled().await {
            return FixOutcome::Cancelled;
        }

        if let Err(e) = server.refresh(&item.rating_key).await {
            return FixOutcome::Failed(format!("API error: {}", e));
        }

        let max_attempts = self.max_attempts();
        for attempt in 1..=max_attempts {
            if cancel.is_cancelled().await {
                return FixOutcome::Cancelled;
            }

            // A failed reload is not fatal; keep polling
            if let Ok(current) = server.reload(&item.rating_key).await {
                if !needs_attention(&current) {
                    let elapsed = self.wait_total.min(self.wait_interval * attempt);
                    return FixOutcome::Fixed(format!("fixed after {}", format_secs(elapsed)));
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.wait_interval).await;
            }
        }

        FixOutcome::Failed(format!("Timeout ({})", format_secs(self.wait_total)))
    }
}

fn format_secs(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cancel::NeverCancel;
    use crate::services::media_server::{Library, MediaServerError};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    fn complete_item() -> MediaItem {
        MediaItem {
            rating_key: "1".into(),
            title: "Heat".into(),
            guids: vec!["imdb://tt0113277".into()],
            thumb: Some("/thumb".into()),
            summary: Some("A heist.".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_complete_item_needs_nothing() {
        assert!(!needs_attention(&complete_item()));
    }

    #[test]
    fn test_any_missing_field_needs_attention() {
        let mut item = complete_item();
        item.guids.clear();
        assert!(needs_attention(&item));

        let mut item = complete_item();
        item.thumb = None;
        assert!(needs_attention(&item));

        let mut item = complete_item();
        item.summary = Some(String::new());
        assert!(needs_attention(&item));

        let mut item = complete_item();
        item.thumb = Some("  ".into());
        assert!(needs_attention(&item));
    }

    #[test]
    fn test_backoff_only_applies_to_recent_failures() {
        let now = Utc::now();
        let day = chrono::Duration::hours(24);

        let remaining = backoff_remaining(Some(ItemState::Failed), Some(now - chrono::Duration::hours(3)), now, day);
        assert_eq!(remaining, Some(chrono::Duration::hours(21)));

        assert_eq!(
            backoff_remaining(Some(ItemState::Failed), Some(now - chrono::Duration::hours(25)), now, day),
            None
        );
        assert_eq!(backoff_remaining(Some(ItemState::Fixed), Some(now), now, day), None);
        assert_eq!(backoff_remaining(Some(ItemState::Failed), None, now, day), None);
        assert_eq!(backoff_remaining(None, Some(now), now, day), None);
    }

    #[test]
    fn test_max_attempts() {
        assert_eq!(RefreshPolicy::default().max_attempts(), 5);
        assert_eq!(RefreshPolicy::from_seconds(10, 4).max_attempts(), 3);
        assert_eq!(RefreshPolicy::from_seconds(2, 4).max_attempts(), 1);
        assert_eq!(RefreshPolicy::from_seconds(0, 0), RefreshPolicy::default());
    }

    /// Becomes complete after `fixed_after` reloads; refresh can be made to fail
    struct PollServer {
        fixed_after: usize,
        refresh_fails: bool,
        reloads: AtomicUsize,
        refreshes: AtomicUsize,
    }

    impl PollServer {
        fn new(fixed_after: usize) -> Self {
            Self {
                fixed_after,
                refresh_fails: false,
                reloads: AtomicUsize::new(0),
                refreshes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MediaServer for PollServer {
        async fn list_libraries(&self) -> Result<Vec<Library>, MediaServerError> {
            Ok(Vec::new())
        }

        async fn recent_items(&self, _: &str, _: u32) -> Result<Vec<MediaItem>, MediaServerError> {
            Ok(Vec::new())
        }

        async fn fetch_item(&self, _: &str) -> Result<MediaItem, MediaServerError> {
            let n = self.reloads.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 1 {
                // One transient failure mid-poll
                return Err(MediaServerError::Transport {
                    endpoint: "/".into(),
                    message: "reset".into(),
                });
            }
            let mut item = complete_item();
            if n < self.fixed_after {
                item.summary = None;
            }
            Ok(item)
        }

        async fn refresh(&self, _: &str) -> Result<(), MediaServerError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.refresh_fails {
                Err(MediaServerError::Status {
                    endpoint: "/refresh".into(),
                    status: 500,
                })
            } else {
                Ok(())
            }
        }
    }

    fn fast_policy() -> RefreshPolicy {
        RefreshPolicy::new(Duration::from_millis(100), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_fix_succeeds_within_budget() {
        let server = PollServer::new(3);
        let outcome = fast_policy().attempt_fix(&server, &complete_item(), &NeverCancel).await;
        assert_eq!(outcome, FixOutcome::Fixed("fixed after 0.0s".to_string()));
        assert_eq!(server.reloads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fix_times_out() {
        let server = PollServer::new(usize::MAX);
        let outcome = fast_policy().attempt_fix(&server, &complete_item(), &NeverCancel).await;
        assert_eq!(outcome, FixOutcome::Failed("Timeout (0.1s)".to_string()));
        assert_eq!(server.reloads.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_refresh_error_skips_polling() {
        let mut server = PollServer::new(1);
        server.refresh_fails = true;
        let outcome = fast_policy().attempt_fix(&server, &complete_item(), &NeverCancel).await;
        assert!(matches!(outcome, FixOutcome::Failed(ref msg) if msg.starts_with("API error:")));
        assert_eq!(server.reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_request() {
        let server = PollServer::new(1);
        let token = CancellationToken::new();
        token.cancel();
        let outcome = fast_policy().attempt_fix(&server, &complete_item(), &token).await;
        assert_eq!(outcome, FixOutcome::Cancelled);
        assert_eq!(server.refreshes.load(Ordering::SeqCst), 0);
    }
}
