//! Cooperative cancellation
//!
//! Long-running work polls a [`CancelSignal`] at its checkpoints. Nothing is
//! preempted: an in-flight request completes and the signal is observed at
//! the next checkpoint.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db::Database;

#[async_trait]
pub trait CancelSignal: Send + Sync {
    async fn is_cancelled(&self) -> bool;
}

#[async_trait]
impl CancelSignal for CancellationToken {
    async fn is_cancelled(&self) -> bool {
        CancellationToken::is_cancelled(self)
    }
}

/// Never cancels
pub struct NeverCancel;

#[async_trait]
impl CancelSignal for NeverCancel {
    async fn is_cancelled(&self) -> bool {
        false
    }
}

/// Cancellation driven by the job ledger's cancel flag, plus an optional
/// process shutdown token.
///
/// Once cancellation has been observed it stays observed, so the ledger is
/// not queried again after the first positive answer.
pub struct LedgerCancel {
    db: Database,
    job_id: String,
    shutdown: Option<CancellationToken>,
    observed: AtomicBool,
}

impl LedgerCancel {
    pub fn new(db: Database, job_id: impl Into<String>, shutdown: Option<CancellationToken>) -> Self {
        Self {
            db,
            job_id: job_id.into(),
            shutdown,
            observed: AtomicBool::new(false),
        }
    }

    /// Whether cancellation has been seen at any checkpoint so far
    pub fn was_observed(&self) -> bool {
        self.observed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CancelSignal for LedgerCancel {
    async fn is_cancelled(&self) -> bool {
        if self.observed.load(Ordering::SeqCst) {
            return true;
        }

        let shutdown = self.shutdown.as_ref().is_some_and(|t| t.is_cancelled());
        let requested = shutdown
            || match self.db.scan_jobs().is_cancel_requested(&self.job_id).await {
                Ok(flag) => flag,
                Err(e) => {
                    // An unreadable flag must not abort the scan
                    warn!(job_id = %self.job_id, error = %e, "Could not read cancel flag");
                    false
                }
            };

        if requested {
            debug!(job_id = %self.job_id, shutdown, "Cancellation observed");
            self.observed.store(true, Ordering::SeqCst);
        }
        requested
    }
}
