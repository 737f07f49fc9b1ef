//! Peer-assisted downloader driving an engine-agnostic torrent backend.
//!
//! The swarm protocol lives behind [`TorrentEngine`]. This module fetches
//! the `.torrent` file, hands it to the engine and polls status until the
//! payload is complete, the engine reports an error, the transfer stalls or
//! the token fires. The engine is always stopped before `download` returns.

use crate::cancel::{self, CancellationToken};
use crate::client::http::HttpClient;
use crate::download::progress::{DownloadProgress, ProgressObservers, ProgressThrottle};
use crate::download::ContentDownloader;
use crate::PatchflowError;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Span};

const NAME: &str = "torrent";

/// Timeout for fetching the `.torrent` file.
const TORRENT_FILE_TIMEOUT: Duration = Duration::from_secs(30);

/// Snapshot of an engine's transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TorrentStatus {
    /// Bytes retrieved so far.
    pub bytes_downloaded: u64,
    /// Total payload size, zero until metadata is known.
    pub bytes_total: u64,
    /// Connected peers.
    pub peers: u32,
    /// Payload fully retrieved and verified by the engine.
    pub is_complete: bool,
    /// Fatal engine error, if any.
    pub error: Option<String>,
}

/// A torrent client backend.
///
/// The engine writes the torrent's payload into the given directory under
/// the file name the torrent declares.
pub trait TorrentEngine: Send {
    /// Start downloading the torrent described by `torrent_file`.
    fn add_torrent(&mut self, torrent_file: &Path, download_dir: &Path)
        -> Result<(), PatchflowError>;

    /// Current transfer status.
    fn status(&mut self) -> Result<TorrentStatus, PatchflowError>;

    /// Stop the transfer and release swarm resources.
    fn stop(&mut self);
}

/// Stops the engine when dropped, whatever the exit path.
struct EngineGuard<'a> {
    engine: &'a mut Box<dyn TorrentEngine>,
}

impl Drop for EngineGuard<'_> {
    fn drop(&mut self) {
        self.engine.stop();
    }
}

/// Downloads a payload through a torrent swarm.
pub struct TorrentDownloader {
    http: Arc<dyn HttpClient>,
    torrent_url: String,
    destination: PathBuf,
    engine: Box<dyn TorrentEngine>,
    poll_interval: Duration,
    stall_timeout: Duration,
    observers: ProgressObservers,
    span: Span,
}

impl TorrentDownloader {
    /// Create a downloader for the torrent at `torrent_url`.
    ///
    /// `destination`'s file name must match the payload name inside the
    /// torrent; its parent directory becomes the engine's download dir.
    pub fn new(
        http: Arc<dyn HttpClient>,
        torrent_url: impl Into<String>,
        destination: PathBuf,
        engine: Box<dyn TorrentEngine>,
    ) -> Self {
        let span = info_span!("torrent_download", destination = %destination.display());
        Self {
            http,
            torrent_url: torrent_url.into(),
            destination,
            engine,
            poll_interval: Duration::from_millis(250),
            stall_timeout: Duration::from_secs(60),
            observers: ProgressObservers::new(),
            span,
        }
    }

    /// How often the engine is polled. Clamped below one second.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.min(Duration::from_millis(999));
        self
    }

    /// Abandon the transfer after this long without progress.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Log under `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    fn download_dir(&self) -> PathBuf {
        self.destination
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn torrent_file_path(&self) -> PathBuf {
        let mut name = self
            .destination
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "payload".into());
        name.push(".torrent");
        self.download_dir().join(name)
    }

    /// Fetch the `.torrent` file next to the destination.
    fn fetch_torrent_file(&self, token: &CancellationToken) -> Result<PathBuf, PatchflowError> {
        debug!(url = %self.torrent_url, "Fetching torrent file");
        let http = Arc::clone(&self.http);
        let url = self.torrent_url.clone();
        let response = cancel::run_blocking(token, TORRENT_FILE_TIMEOUT, move || {
            http.get(&url, TORRENT_FILE_TIMEOUT)
        })
        .map_err(|e| failure(token, e))?;
        if !response.is_success() {
            return Err(PatchflowError::download_failed(
                NAME,
                format!("torrent file request answered with status {}", response.status),
            ));
        }

        let path = self.torrent_file_path();
        fs::create_dir_all(self.download_dir())
            .and_then(|()| fs::write(&path, &response.body))
            .map_err(|e| {
                PatchflowError::download_failed(NAME, format!("Failed to store torrent file: {}", e))
            })?;
        Ok(path)
    }
}

/// Classify a failed step; a fired token always wins.
fn failure(token: &CancellationToken, error: PatchflowError) -> PatchflowError {
    if token.is_cancelled() {
        return PatchflowError::OperationCancelled;
    }
    match error {
        e @ PatchflowError::DownloadFailed { .. } => e,
        e => PatchflowError::download_failed(NAME, e.to_string()),
    }
}

impl ContentDownloader for TorrentDownloader {
    fn name(&self) -> &'static str {
        NAME
    }

    fn progress(&self) -> &ProgressObservers {
        &self.observers
    }

    fn download(&mut self, token: &CancellationToken) -> Result<PathBuf, PatchflowError> {
        let span = self.span.clone();
        let _enter = span.enter();
        cancel::ensure_not_cancelled(token)?;

        let torrent_file = self.fetch_torrent_file(token)?;
        cancel::ensure_not_cancelled(token)?;

        let download_dir = self.download_dir();
        let poll_interval = self.poll_interval;
        let stall_timeout = self.stall_timeout;
        let observers = &self.observers;
        let destination = &self.destination;

        self.engine
            .add_torrent(&torrent_file, &download_dir)
            .map_err(|e| failure(token, e))?;
        let guard = EngineGuard {
            engine: &mut self.engine,
        };

        let mut throttle = ProgressThrottle::default();
        let mut last_bytes = 0u64;
        let mut last_progress_at = Instant::now();

        loop {
            let status = guard
                .engine
                .status()
                .map_err(|e| failure(token, e))?;

            if let Some(error) = status.error {
                warn!(%error, "Torrent engine reported an error");
                return Err(PatchflowError::download_failed(NAME, error));
            }

            let progress = DownloadProgress::new(status.bytes_downloaded, status.bytes_total);
            if status.is_complete {
                if !destination.exists() {
                    return Err(PatchflowError::download_failed(
                        NAME,
                        format!("engine finished but {} is missing", destination.display()),
                    ));
                }
                observers.emit(progress);
                info!(bytes = status.bytes_downloaded, "Torrent download finished");
                return Ok(destination.clone());
            }
            if throttle.should_emit() {
                observers.emit(progress);
            }

            if status.bytes_downloaded > last_bytes {
                last_bytes = status.bytes_downloaded;
                last_progress_at = Instant::now();
            } else if last_progress_at.elapsed() >= stall_timeout {
                return Err(PatchflowError::download_failed(
                    NAME,
                    format!(
                        "no progress for {:?} ({} peers)",
                        stall_timeout, status.peers
                    ),
                ));
            }

            if let Err(e) = cancel::sleep(token, poll_interval) {
                info!("Torrent download cancelled");
                return Err(e);
            }
        }
    }
}
