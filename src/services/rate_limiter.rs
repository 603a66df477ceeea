//! Throttled HTTP access and retries for outbound calls
//!
//! Every Plex and Telegram request waits for a permit from a per-client
//! token bucket. Idempotent reads can additionally be wrapped in
//! [`retry_transient`], which backs off exponentially between attempts.

use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::{Client, Method, RequestBuilder};
use tracing::{debug, warn};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Who a client talks to, and how hard it may do so
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    /// Plex publishes no limits, but every refresh triggers agent lookups on
    /// the server
    Plex,
    /// Bot API allows roughly one message per second per chat
    Telegram,
}

impl Upstream {
    pub fn name(&self) -> &'static str {
        match self {
            Upstream::Plex => "plex",
            Upstream::Telegram => "telegram",
        }
    }

    /// (requests per second, burst)
    fn quota(&self) -> (u32, u32) {
        match self {
            Upstream::Plex => (5, 10),
            Upstream::Telegram => (1, 3),
        }
    }
}

/// An HTTP client that waits for a permit before every request
#[derive(Clone)]
pub struct RateLimitedClient {
    client: Client,
    limiter: Arc<DirectLimiter>,
    upstream: Upstream,
}

impl RateLimitedClient {
    pub fn new(upstream: Upstream, timeout: Duration) -> Result<Self> {
        let (per_second, burst) = upstream.quota();
        let quota = Quota::per_second(NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN));

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .with_context(|| format!("Failed to build HTTP client for {}", upstream.name()))?;

        Ok(Self {
            client,
            limiter: Arc::new(RateLimiter::direct(quota)),
            upstream,
        })
    }

    pub fn upstream(&self) -> Upstream {
        self.upstream
    }

    /// Wait for a permit, then start building the request
    pub async fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.limiter.until_ready().await;
        debug!(client = self.upstream.name(), %method, url, "Outbound request");
        self.client.request(method, url)
    }
}

/// How often and how patiently to retry a failing call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub attempts: u32,
    pub first_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            first_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// A single attempt; used where the caller already polls
    pub fn once() -> Self {
        Self {
            attempts: 1,
            ..Default::default()
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.first_delay,
            max_interval: self.max_delay,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Run `call` until it succeeds, fails with an error `is_transient` rejects,
/// or the policy's attempts are used up. The last error is returned.
pub async fn retry_transient<T, E, F, Fut>(
    policy: &RetryPolicy,
    endpoint: &str,
    is_transient: impl Fn(&E) -> bool,
    call: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = policy.backoff();
    let mut attempt = 1;

    loop {
        let error = match call().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !is_transient(&error) || attempt >= policy.attempts {
            if attempt > 1 {
                warn!(endpoint, attempts = attempt, error = %error, "Giving up after retries");
            }
            return Err(error);
        }

        let Some(delay) = backoff.next_backoff() else {
            return Err(error);
        };
        warn!(
            endpoint,
            attempt,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "Transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Statuses worth retrying: timeouts, throttling and server errors
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}
