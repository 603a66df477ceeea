//! Scan services and external integrations

pub mod cancel;
pub mod connection;
pub mod job_log;
pub mod media_server;
pub mod notifications;
pub mod plex;
pub mod rate_limiter;
pub mod refresh_policy;
pub mod scan_engine;

pub use cancel::{CancelSignal, LedgerCancel, NeverCancel};
pub use connection::{ConnectionManager, MediaServerConnector};
pub use job_log::JobLog;
pub use media_server::{Library, MediaItem, MediaServer, MediaServerError};
pub use notifications::{NoopNotifier, ScanNotifier, TelegramNotifier};
pub use plex::{PlexClient, PlexConnector};
pub use refresh_policy::{FixOutcome, RefreshPolicy, needs_attention};
pub use scan_engine::{ScanEngine, ScanPhase, ScanProgress, ScanStats};
