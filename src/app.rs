//! Application wiring.
//!
//! Builds the store, connection manager, scan engine and job coordinator once
//! and shares them by `Arc`. Used by [main] for every command.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::jobs::ScanCoordinator;
use crate::services::{
    ConnectionManager, NoopNotifier, PlexConnector, ScanEngine, ScanNotifier, TelegramNotifier,
};

/// Shared application state
#[derive(Clone)]
pub struct App {
    pub config: Arc<Config>,
    pub db: Database,
    pub connections: Arc<ConnectionManager>,
    pub coordinator: Arc<ScanCoordinator>,
    pub shutdown: CancellationToken,
}

impl App {
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let db = Database::connect(&config.database_path).await?;
        info!(path = %config.database_path.display(), "State store ready");

        let connector = PlexConnector::new(
            config.plex_url.clone(),
            config.plex_token.clone(),
            config.plex_timeout,
        );
        let connections = Arc::new(ConnectionManager::new(Arc::new(connector)));

        let notifier: Arc<dyn ScanNotifier> = match TelegramNotifier::from_credentials(
            config.telegram_bot_token.clone(),
            config.telegram_chat_id.clone(),
        ) {
            Ok(Some(telegram)) => {
                info!("Telegram notifications enabled");
                Arc::new(telegram)
            }
            Ok(None) => Arc::new(NoopNotifier),
            Err(e) => {
                warn!(error = %e, "Telegram notifier unavailable, notifications disabled");
                Arc::new(NoopNotifier)
            }
        };

        let engine = Arc::new(ScanEngine::new(db.clone(), connections.clone(), notifier));
        let shutdown = CancellationToken::new();
        let coordinator = Arc::new(ScanCoordinator::new(
            db.clone(),
            engine,
            config.coordinator_config(),
            shutdown.clone(),
        ));

        Ok(Self {
            config,
            db,
            connections,
            coordinator,
            shutdown,
        })
    }

    /// Startup chores for every command that runs scans
    pub async fn prepare(&self) {
        match self
            .db
            .settings()
            .import_legacy_settings(&self.config.settings_path)
            .await
        {
            Ok(true) => info!(path = %self.config.settings_path.display(), "Imported legacy settings"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Legacy settings import failed"),
        }
    }

    /// Startup chores of the long-lived service: [`App::prepare`], then
    /// orphan recovery and retention cleanup.
    ///
    /// One-shot commands must not call this. A `running` row may belong to
    /// a live service process, and recovering it would free the ledger slot
    /// under a scan that is still executing.
    pub async fn prepare_service(&self) {
        self.prepare().await;

        if let Err(e) = self.coordinator.recover_orphaned_jobs().await {
            warn!(error = %e, "Orphaned job recovery failed");
        }

        if let Err(e) = self.coordinator.cleanup().await {
            warn!(error = %e, "Startup cleanup failed");
        }
    }
}
