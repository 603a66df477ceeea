//! Lazily built, health-checked media server handle
//!
//! Scans share one handle. It is built on first use, validated at most once
//! per check interval with a cheap library listing, and rebuilt when that
//! check fails or a caller forces a reconnect. The reconnect decision sits
//! behind an async mutex, so concurrent callers converge on the same handle
//! instead of each paying for a reconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::media_server::{MediaServer, MediaServerError};

/// Default interval between health checks of a cached handle
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Builds a fresh media server handle from configured credentials
#[async_trait]
pub trait MediaServerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn MediaServer>, MediaServerError>;
}

#[derive(Default)]
struct ConnectionState {
    handle: Option<Arc<dyn MediaServer>>,
    last_check: Option<Instant>,
}

pub struct ConnectionManager {
    connector: Arc<dyn MediaServerConnector>,
    check_interval: Duration,
    state: Mutex<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn MediaServerConnector>) -> Self {
        Self::with_check_interval(connector, DEFAULT_HEALTH_CHECK_INTERVAL)
    }

    pub fn with_check_interval(connector: Arc<dyn MediaServerConnector>, check_interval: Duration) -> Self {
        Self {
            connector,
            check_interval,
            state: Mutex::new(ConnectionState::default()),
        }
    }

    /// Return a live handle, reconnecting when needed.
    ///
    /// Connection errors are returned to the caller, not retried here.
    pub async fn get_connection(&self, force: bool) -> Result<Arc<dyn MediaServer>, MediaServerError> {
        let mut state = self.state.lock().await;

        if force {
            debug!(service = "connection", "Forced reconnect requested");
            state.handle = None;
        }

        if let Some(handle) = state.handle.clone() {
            let fresh = state
                .last_check
                .is_some_and(|checked| checked.elapsed() < self.check_interval);
            if fresh {
                return Ok(handle);
            }

            match handle.list_libraries().await {
                Ok(_) => {
                    state.last_check = Some(Instant::now());
                    return Ok(handle);
                }
                Err(e) => {
                    warn!(service = "connection", error = %e, "Health check failed, reconnecting");
                    state.handle = None;
                    state.last_check = None;
                }
            }
        }

        let handle = self.connector.connect().await?;
        info!(service = "connection", "Media server connection established");
        state.handle = Some(handle.clone());
        state.last_check = Some(Instant::now());
        Ok(handle)
    }

    /// Drop the cached handle so the next call reconnects
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.handle = None;
        state.last_check = None;
    }
}
