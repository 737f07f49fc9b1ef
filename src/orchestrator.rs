//! End-to-end update pipeline.
//!
//! Stages run strictly in order on one worker thread:
//! 1. Resolve the target version (latest, or a pinned id)
//! 2. Validate the license if the application uses keys
//! 3. Fetch the content summary, or one diff summary per version to apply
//! 4. Download each payload (torrent first, direct HTTP once on failure)
//! 5. Hand each payload to the patch sink
//!
//! Any stage failure aborts the rest. Cancellation propagates unchanged as
//! `OperationCancelled`.

use crate::cancel::{self, CancellationToken};
use crate::client::http::HttpClient;
use crate::config::{DownloadStrategy, PatchflowConfig};
use crate::download::http::HttpDownloader;
use crate::download::torrent::{TorrentDownloader, TorrentEngine};
use crate::download::{ContentDownloader, ProgressObservers};
use crate::license::{LicenseDialog, LicenseValidator};
use crate::metadata::{PayloadKind, RemoteMetadataService};
use crate::protocol::models::{Chunks, ContentSummary, DiffSummary};
use crate::types::{validate_version_id, KeySecret, VersionId};
use crate::PatchflowError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, info_span, warn, Span};

/// Which version to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionTarget {
    /// Newest published version.
    #[default]
    Latest,
    /// A specific version.
    Pinned(VersionId),
}

/// Input of one orchestration run.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    /// Version to install.
    pub target: VersionTarget,
    /// Version currently installed, if any.
    pub installed: Option<VersionId>,
    /// Key secret obtained in an earlier session, used as a hint.
    pub cached_key_secret: Option<KeySecret>,
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Installed version already matches the target.
    UpToDate(VersionId),
    /// The target version was installed.
    Updated {
        /// Version installed before the run.
        from: Option<VersionId>,
        /// Version installed now.
        to: VersionId,
        /// Key secret used, for the caller to cache.
        key_secret: Option<KeySecret>,
    },
}

/// A downloaded payload ready for application.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Full content of a version.
    Content {
        /// Version the content belongs to.
        version_id: VersionId,
        /// Summary the download was driven by.
        summary: ContentSummary,
        /// Downloaded file.
        path: PathBuf,
    },
    /// Delta bringing the previous version to `version_id`.
    Diff {
        /// Version the diff produces.
        version_id: VersionId,
        /// Summary the download was driven by.
        summary: DiffSummary,
        /// Downloaded file.
        path: PathBuf,
    },
}

impl Payload {
    /// Version this payload produces.
    pub fn version_id(&self) -> VersionId {
        match self {
            Self::Content { version_id, .. } | Self::Diff { version_id, .. } => *version_id,
        }
    }

    /// Downloaded file.
    pub fn path(&self) -> &Path {
        match self {
            Self::Content { path, .. } | Self::Diff { path, .. } => path,
        }
    }
}

/// Applies downloaded payloads on disk. Implemented by the host.
pub trait PatchSink: Send + Sync {
    /// Apply `payload`; may block and should honor `token`.
    fn apply(
        &self,
        payload: &Payload,
        key_secret: Option<&KeySecret>,
        token: &CancellationToken,
    ) -> Result<(), PatchflowError>;
}

/// Builds a fresh torrent engine for each torrent attempt.
pub trait TorrentEngineFactory: Send + Sync {
    /// Create an engine.
    fn create(&self) -> Result<Box<dyn TorrentEngine>, PatchflowError>;
}

/// Composes metadata, license validation, downloaders and the patch sink.
pub struct UpdateOrchestrator {
    config: PatchflowConfig,
    metadata: RemoteMetadataService,
    http: Arc<dyn HttpClient>,
    dialog: Arc<dyn LicenseDialog>,
    sink: Arc<dyn PatchSink>,
    torrent_engines: Option<Arc<dyn TorrentEngineFactory>>,
    observers: Arc<ProgressObservers>,
    span: Span,
}

impl UpdateOrchestrator {
    /// Create an orchestrator.
    ///
    /// `http` is used for payload transfers; `metadata` keeps its own
    /// connections.
    pub fn new(
        config: PatchflowConfig,
        metadata: RemoteMetadataService,
        http: Arc<dyn HttpClient>,
        dialog: Arc<dyn LicenseDialog>,
        sink: Arc<dyn PatchSink>,
    ) -> Result<Self, PatchflowError> {
        config.validate()?;
        Ok(Self {
            config,
            metadata,
            http,
            dialog,
            sink,
            torrent_engines: None,
            observers: Arc::new(ProgressObservers::new()),
            span: info_span!("update"),
        })
    }

    /// Enable the peer-assisted downloader.
    ///
    /// Without a factory every strategy degrades to direct HTTP.
    pub fn with_torrent_engines(mut self, factory: Arc<dyn TorrentEngineFactory>) -> Self {
        self.torrent_engines = Some(factory);
        self
    }

    /// Log under `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Progress of whichever downloader is currently running.
    pub fn progress(&self) -> &ProgressObservers {
        &self.observers
    }

    /// Metadata service used by this orchestrator.
    pub fn metadata(&self) -> &RemoteMetadataService {
        &self.metadata
    }

    /// Run the pipeline on a dedicated `update-worker` thread.
    pub fn spawn(
        self,
        request: UpdateRequest,
        token: CancellationToken,
    ) -> Result<JoinHandle<Result<UpdateOutcome, PatchflowError>>, PatchflowError> {
        std::thread::Builder::new()
            .name("update-worker".to_string())
            .spawn(move || self.run(&request, &token))
            .map_err(|e| PatchflowError::Io(format!("Failed to spawn update worker: {}", e)))
    }

    /// Run the pipeline on the current thread.
    pub fn run(
        &self,
        request: &UpdateRequest,
        token: &CancellationToken,
    ) -> Result<UpdateOutcome, PatchflowError> {
        let _enter = self.span.enter();

        let target = self.resolve_target(request.target, token)?;
        info!(target, installed = ?request.installed, "Resolved target version");

        if let Some(installed) = request.installed {
            validate_version_id(installed)?;
            if installed == target {
                info!("Already up to date");
                return Ok(UpdateOutcome::UpToDate(target));
            }
        }

        let key_secret = LicenseValidator::new(&self.metadata, Arc::clone(&self.dialog))
            .with_cached_key_secret(request.cached_key_secret.clone())
            .execute(token)?;

        match request.installed {
            Some(installed) if installed < target => {
                for version_id in (installed + 1)..=target {
                    self.update_with_diff(version_id, key_secret.as_ref(), token)?;
                }
            }
            _ => self.install_content(target, key_secret.as_ref(), token)?,
        }

        info!(target, "Update finished");
        Ok(UpdateOutcome::Updated {
            from: request.installed,
            to: target,
            key_secret,
        })
    }

    fn resolve_target(
        &self,
        target: VersionTarget,
        token: &CancellationToken,
    ) -> Result<VersionId, PatchflowError> {
        match target {
            VersionTarget::Latest => self.metadata.get_latest_version_id(token),
            VersionTarget::Pinned(id) => {
                validate_version_id(id)?;
                Ok(id)
            }
        }
    }

    fn install_content(
        &self,
        version_id: VersionId,
        key_secret: Option<&KeySecret>,
        token: &CancellationToken,
    ) -> Result<(), PatchflowError> {
        let summary = self.metadata.get_content_summary(version_id, token)?;
        let path = self.acquire(
            version_id,
            PayloadKind::Content,
            summary.size,
            summary.chunks.clone(),
            key_secret,
            token,
        )?;
        let payload = Payload::Content {
            version_id,
            summary,
            path,
        };
        self.apply(&payload, key_secret, token)
    }

    fn update_with_diff(
        &self,
        version_id: VersionId,
        key_secret: Option<&KeySecret>,
        token: &CancellationToken,
    ) -> Result<(), PatchflowError> {
        let summary = self.metadata.get_diff_summary(version_id, token)?;
        let path = self.acquire(
            version_id,
            PayloadKind::Diff,
            summary.size,
            summary.chunks.clone(),
            key_secret,
            token,
        )?;
        let payload = Payload::Diff {
            version_id,
            summary,
            path,
        };
        self.apply(&payload, key_secret, token)
    }

    fn apply(
        &self,
        payload: &Payload,
        key_secret: Option<&KeySecret>,
        token: &CancellationToken,
    ) -> Result<(), PatchflowError> {
        cancel::ensure_not_cancelled(token)?;
        debug!(version_id = payload.version_id(), path = %payload.path().display(), "Applying payload");
        self.sink.apply(payload, key_secret, token)
    }

    fn destination(&self, version_id: VersionId, kind: PayloadKind) -> PathBuf {
        let name = match kind {
            PayloadKind::Content => format!("content_{}.package", version_id),
            PayloadKind::Diff => format!("diff_{}.package", version_id),
        };
        self.config.download_dir.join(name)
    }

    /// Download one payload, falling back from torrent to HTTP at most once.
    fn acquire(
        &self,
        version_id: VersionId,
        kind: PayloadKind,
        size: u64,
        chunks: Option<Chunks>,
        key_secret: Option<&KeySecret>,
        token: &CancellationToken,
    ) -> Result<PathBuf, PatchflowError> {
        let destination = self.destination(version_id, kind);
        let strategy = match (&self.torrent_engines, self.config.download_strategy) {
            (None, DownloadStrategy::TorrentOnly) => {
                return Err(PatchflowError::ConfigError(
                    "torrent-only strategy requires a torrent engine".to_string(),
                ))
            }
            (None, _) => DownloadStrategy::HttpOnly,
            (Some(_), strategy) => strategy,
        };

        if strategy != DownloadStrategy::HttpOnly {
            match self.download_torrent(version_id, kind, &destination, key_secret, token) {
                Ok(path) => return Ok(path),
                Err(e @ PatchflowError::DownloadFailed { .. })
                    if strategy == DownloadStrategy::TorrentWithHttpFallback =>
                {
                    warn!(error = %e, "Torrent download failed, falling back to HTTP");
                }
                Err(e) => return Err(e),
            }
        }

        let urls = self
            .metadata
            .get_resource_urls(version_id, kind, key_secret, token)?;
        let downloader = HttpDownloader::new(Arc::clone(&self.http), urls, destination)
            .with_expected_size(size)
            .with_chunks(chunks)
            .with_buffer_size(self.config.http_buffer_size);
        self.run_downloader(Box::new(downloader), token)
    }

    fn download_torrent(
        &self,
        version_id: VersionId,
        kind: PayloadKind,
        destination: &Path,
        key_secret: Option<&KeySecret>,
        token: &CancellationToken,
    ) -> Result<PathBuf, PatchflowError> {
        let Some(factory) = &self.torrent_engines else {
            return Err(PatchflowError::download_failed("torrent", "no torrent engine"));
        };
        let torrent_url = self
            .metadata
            .get_torrent_url(version_id, kind, key_secret, token)
            .map_err(|e| match e {
                _ if token.is_cancelled() => PatchflowError::OperationCancelled,
                PatchflowError::OperationCancelled => e,
                other => PatchflowError::download_failed("torrent", other.to_string()),
            })?;
        let engine = factory
            .create()
            .map_err(|e| PatchflowError::download_failed("torrent", e.to_string()))?;

        let downloader = TorrentDownloader::new(
            Arc::clone(&self.http),
            torrent_url,
            destination.to_path_buf(),
            engine,
        )
        .with_poll_interval(self.config.torrent_poll_interval)
        .with_stall_timeout(self.config.torrent_stall_timeout);
        self.run_downloader(Box::new(downloader), token)
    }

    /// Run `downloader`, forwarding its progress to our observers.
    fn run_downloader(
        &self,
        mut downloader: Box<dyn ContentDownloader>,
        token: &CancellationToken,
    ) -> Result<PathBuf, PatchflowError> {
        let observers = Arc::clone(&self.observers);
        let subscription = downloader.progress().subscribe(move |p| observers.emit(p));

        info!(downloader = downloader.name(), "Starting download");
        let result = downloader.download(token);
        downloader.progress().unsubscribe(subscription);
        result
    }
}
