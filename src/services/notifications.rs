//! Scan completion notifications
//!
//! Notification is best effort. The scan engine logs and drops any error a
//! notifier returns.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::json;
use tracing::{debug, info};

use super::rate_limiter::{RateLimitedClient, Upstream};
use super::scan_engine::ScanStats;

#[async_trait]
pub trait ScanNotifier: Send + Sync {
    async fn scan_completed(&self, stats: &ScanStats) -> Result<()>;
}

/// Used when no notification channel is configured
pub struct NoopNotifier;

#[async_trait]
impl ScanNotifier for NoopNotifier {
    async fn scan_completed(&self, stats: &ScanStats) -> Result<()> {
        debug!(checked = stats.checked, "No notifier configured, skipping scan notification");
        Ok(())
    }
}

/// Sends an HTML summary through the Telegram Bot API
pub struct TelegramNotifier {
    client: RateLimitedClient,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: String) -> Result<Self> {
        Ok(Self {
            client: RateLimitedClient::new(Upstream::Telegram, Duration::from_secs(10))?,
            api_base: "https://api.telegram.org".to_string(),
            bot_token,
            chat_id,
        })
    }

    /// Build from optional credentials; `None` unless both are present
    pub fn from_credentials(bot_token: Option<String>, chat_id: Option<String>) -> Result<Option<Self>> {
        match (bot_token, chat_id) {
            (Some(token), Some(chat)) if !token.is_empty() && !chat.is_empty() => {
                Ok(Some(Self::new(token, chat)?))
            }
            _ => Ok(None),
        }
    }
}

/// Render the completion message
pub fn format_scan_message(stats: &ScanStats) -> String {
    let rate = match stats.success_rate() {
        Some(rate) => {
            let marker = if rate >= 80.0 {
                "🟢"
            } else if rate >= 50.0 {
                "🟡"
            } else {
                "🔴"
            };
            format!("{} {:.1}%", marker, rate)
        }
        None => "✨ No problems found".to_string(),
    };

    let mut message = format!(
        "🚀 <b>Plex Smart Refresher - scan finished</b>\n\n\
         📊 <b>Statistics:</b>\n\
         • Checked: {}\n\
         • Fixed: {} ✅\n\
         • Failed: {} ❌\n",
        stats.checked, stats.fixed, stats.failed
    );
    if stats.would_fix > 0 {
        message.push_str(&format!("• Would fix (dry run): {}\n", stats.would_fix));
    }
    message.push_str(&format!("• Result: {}", rate));
    message
}

#[async_trait]
impl ScanNotifier for TelegramNotifier {
    async fn scan_completed(&self, stats: &ScanStats) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let payload = json!({
            "chat_id": self.chat_id,
            "text": format_scan_message(stats),
            "parse_mode": "HTML",
        });

        let response = self
            .client
            .request(Method::POST, &url)
            .await
            .json(&payload)
            .send()
            .await
            .context("Telegram request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Telegram returned HTTP {}", response.status());
        }

        info!(service = "telegram", "Scan notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_reports_success_rate() {
        let stats = ScanStats {
            checked: 10,
            fixed: 4,
            would_fix: 0,
            failed: 1,
        };
        let message = format_scan_message(&stats);
        assert!(message.contains("Checked: 10"));
        assert!(message.contains("🟢 80.0%"));
        assert!(!message.contains("dry run"));
    }

    #[test]
    fn test_message_without_attempts() {
        let stats = ScanStats {
            checked: 3,
            fixed: 0,
            would_fix: 2,
            failed: 0,
        };
        let message = format_scan_message(&stats);
        assert!(message.contains("No problems found"));
        assert!(message.contains("Would fix (dry run): 2"));
    }

    #[test]
    fn test_rate_thresholds() {
        let stats = |fixed, failed| ScanStats {
            checked: 10,
            fixed,
            would_fix: 0,
            failed,
        };
        assert!(format_scan_message(&stats(1, 1)).contains("🟡 50.0%"));
        assert!(format_scan_message(&stats(1, 3)).contains("🔴 25.0%"));
    }

    #[test]
    fn test_credentials_must_both_be_present() {
        assert!(TelegramNotifier::from_credentials(None, Some("1".into())).unwrap().is_none());
        assert!(TelegramNotifier::from_credentials(Some("t".into()), Some(String::new())).unwrap().is_none());
        assert!(TelegramNotifier::from_credentials(Some("t".into()), Some("1".into())).unwrap().is_some());
    }
}
