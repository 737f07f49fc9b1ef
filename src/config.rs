//! Patchflow configuration.

use crate::PatchflowError;
use std::path::PathBuf;
use std::time::Duration;

/// Default catalog API endpoint.
pub const DEFAULT_MAIN_API_URL: &str = "https://api2.patchkit.net";

/// Default licensing API endpoint.
pub const DEFAULT_KEYS_API_URL: &str = "https://keys2.patchkit.net";

/// How the orchestrator picks a downloader variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStrategy {
    /// Try the peer-assisted downloader, fall back to direct HTTP once.
    TorrentWithHttpFallback,
    /// Direct HTTP only.
    HttpOnly,
    /// Peer-assisted only, no fallback.
    TorrentOnly,
}

/// Configuration for one update orchestration session.
#[derive(Debug, Clone)]
pub struct PatchflowConfig {
    /// Application secret issued by the catalog.
    pub app_secret: String,

    /// Base URL of the catalog ("main") API.
    pub main_api_url: String,

    /// Base URL of the licensing ("keys") API.
    pub keys_api_url: String,

    /// User-Agent product identifier sent with every request.
    pub user_agent_product: String,

    /// Directory where payloads are downloaded.
    pub download_dir: PathBuf,

    /// Downloader selection policy.
    pub download_strategy: DownloadStrategy,

    /// How often the torrent engine is polled. Must stay under one second
    /// so cancellation is observed promptly.
    pub torrent_poll_interval: Duration,

    /// A torrent making no progress for this long is abandoned.
    pub torrent_stall_timeout: Duration,

    /// Read buffer for direct downloads; cancellation is checked per buffer.
    pub http_buffer_size: usize,
}

impl PatchflowConfig {
    /// Configuration with default endpoints and tuning for `app_secret`.
    pub fn new(app_secret: impl Into<String>) -> Self {
        Self {
            app_secret: app_secret.into(),
            main_api_url: DEFAULT_MAIN_API_URL.to_string(),
            keys_api_url: DEFAULT_KEYS_API_URL.to_string(),
            user_agent_product: "patchflow".to_string(),
            download_dir: default_download_dir(),
            download_strategy: DownloadStrategy::TorrentWithHttpFallback,
            torrent_poll_interval: Duration::from_millis(250),
            torrent_stall_timeout: Duration::from_secs(60),
            http_buffer_size: 64 * 1024,
        }
    }

    /// Validate configuration for obvious errors.
    pub fn validate(&self) -> Result<(), PatchflowError> {
        if self.app_secret.trim().is_empty() {
            return Err(PatchflowError::InvalidArgument(
                "app_secret cannot be empty".to_string(),
            ));
        }
        if self.main_api_url.is_empty() {
            return Err(PatchflowError::ConfigError(
                "main_api_url cannot be empty".to_string(),
            ));
        }
        if self.keys_api_url.is_empty() {
            return Err(PatchflowError::ConfigError(
                "keys_api_url cannot be empty".to_string(),
            ));
        }
        if self.torrent_poll_interval.is_zero()
            || self.torrent_poll_interval >= Duration::from_secs(1)
        {
            return Err(PatchflowError::ConfigError(format!(
                "torrent_poll_interval must be between 0 and 1s, got {:?}",
                self.torrent_poll_interval
            )));
        }
        if self.http_buffer_size == 0 {
            return Err(PatchflowError::ConfigError(
                "http_buffer_size cannot be zero".to_string(),
            ));
        }
        Ok(())
    }

    /// User-Agent header value.
    ///
    /// Format: `<product> patchflow/<version>`
    pub fn user_agent(&self) -> String {
        format!(
            "{} patchflow/{}",
            self.user_agent_product,
            env!("CARGO_PKG_VERSION")
        )
    }
}

/// `<data dir>/patchflow/downloads`, or a relative fallback when the
/// platform has no data directory.
pub fn default_download_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("patchflow"))
        .unwrap_or_else(|| PathBuf::from(".patchflow"))
        .join("downloads")
}
