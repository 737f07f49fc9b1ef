//! Direct HTTP downloader with resume and chunk verification.
//!
//! Mirrors are tried in order. A partial file left by an earlier attempt is
//! resumed with a range request; when a chunk manifest is known, only the
//! verified prefix is kept.

use crate::cancel::{self, CancellationToken};
use crate::client::http::HttpClient;
use crate::download::checksum::{first_corrupt_chunk, validate_chunks, verified_prefix};
use crate::download::progress::{DownloadProgress, ProgressObservers, ProgressThrottle};
use crate::download::ContentDownloader;
use crate::protocol::models::{Chunks, ResourceUrl};
use crate::PatchflowError;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Span};

const NAME: &str = "http";

/// How long a transfer may go without receiving a byte.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffers queued between the reader thread and the writer.
const PUMP_DEPTH: usize = 4;

enum Piece {
    Data(Vec<u8>),
    End,
    Failed(PatchflowError),
}

/// Reads a response body on its own thread so that waiting for the next
/// buffer stays cancellable and stalls are detected.
struct BodyPump {
    rx: Receiver<Piece>,
}

impl BodyPump {
    fn start(mut reader: Box<dyn Read + Send>, buffer_size: usize) -> Result<Self, PatchflowError> {
        let (tx, rx) = mpsc::sync_channel(PUMP_DEPTH);
        thread::Builder::new()
            .name("http-body".to_string())
            .spawn(move || {
                let mut buf = vec![0u8; buffer_size];
                loop {
                    let piece = match reader.read(&mut buf) {
                        Ok(0) => Piece::End,
                        Ok(n) => Piece::Data(buf[..n].to_vec()),
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => Piece::Failed(PatchflowError::Transport(format!(
                            "Failed to read body: {}",
                            e
                        ))),
                    };
                    let last = !matches!(piece, Piece::Data(_));
                    // A dropped receiver means the download was abandoned.
                    if tx.send(piece).is_err() || last {
                        break;
                    }
                }
            })
            .map_err(|e| PatchflowError::Io(format!("Failed to spawn body reader: {}", e)))?;
        Ok(Self { rx })
    }

    /// Next buffer, or `None` at end of body.
    fn next(
        &self,
        token: &CancellationToken,
        idle_timeout: Duration,
    ) -> Result<Option<Vec<u8>>, PatchflowError> {
        let deadline = Instant::now() + idle_timeout;
        loop {
            cancel::ensure_not_cancelled(token)?;
            match self.rx.recv_timeout(cancel::POLL_SLICE) {
                Ok(Piece::Data(data)) => return Ok(Some(data)),
                Ok(Piece::End) => return Ok(None),
                Ok(Piece::Failed(e)) => {
                    cancel::ensure_not_cancelled(token)?;
                    return Err(e);
                }
                Err(RecvTimeoutError::Timeout) if Instant::now() >= deadline => {
                    return Err(PatchflowError::Transport(format!(
                        "no data received for {:?}",
                        idle_timeout
                    )));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(PatchflowError::Transport(
                        "body reader stopped unexpectedly".to_string(),
                    ));
                }
            }
        }
    }
}

/// Downloads a payload directly from its mirror URLs.
pub struct HttpDownloader {
    http: Arc<dyn HttpClient>,
    urls: Vec<ResourceUrl>,
    destination: PathBuf,
    expected_size: Option<u64>,
    chunks: Option<Chunks>,
    buffer_size: usize,
    idle_timeout: Duration,
    observers: ProgressObservers,
    span: Span,
}

impl HttpDownloader {
    /// Create a downloader writing to `destination`.
    pub fn new(http: Arc<dyn HttpClient>, urls: Vec<ResourceUrl>, destination: PathBuf) -> Self {
        let span = info_span!("http_download", destination = %destination.display());
        Self {
            http,
            urls,
            destination,
            expected_size: None,
            chunks: None,
            buffer_size: 64 * 1024,
            idle_timeout: IDLE_TIMEOUT,
            observers: ProgressObservers::new(),
            span,
        }
    }

    /// Fail unless exactly `size` bytes are retrieved.
    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    /// Verify the result against a chunk manifest.
    pub fn with_chunks(mut self, chunks: Option<Chunks>) -> Self {
        self.chunks = chunks;
        self
    }

    /// Read buffer size; cancellation is checked once per buffer.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Abandon a mirror that sends nothing for `timeout`.
    ///
    /// Also bounds the wait for response headers.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Log under `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Where the payload is written.
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Offset to resume from, discarding unusable partial data.
    fn resume_offset(&self) -> u64 {
        let existing = match fs::metadata(&self.destination) {
            Ok(meta) => meta.len(),
            Err(_) => return 0,
        };
        if let Some(expected) = self.expected_size {
            if existing > expected {
                return 0;
            }
        }
        match &self.chunks {
            Some(chunks) if !chunks.hashes.is_empty() => {
                verified_prefix(&self.destination, chunks).unwrap_or(0)
            }
            _ => existing,
        }
    }

    fn download_from(
        &self,
        url: &ResourceUrl,
        token: &CancellationToken,
    ) -> Result<(), PatchflowError> {
        let offset = self.resume_offset();
        if offset > 0 && Some(offset) == self.expected_size {
            debug!(offset, "Payload already complete on disk");
            self.observers.emit(DownloadProgress::new(offset, offset));
            return Ok(());
        }

        debug!(url = %url.url, offset, "Opening stream");
        let http = Arc::clone(&self.http);
        let target = url.url.clone();
        let stream = cancel::run_blocking(token, self.idle_timeout, move || {
            http.get_stream(&target, offset)
        })?;
        if !(200..300).contains(&stream.status) {
            return Err(PatchflowError::download_failed(
                NAME,
                format!("{} answered with status {}", url.url, stream.status),
            ));
        }

        let mut file = open_at(&self.destination, stream.offset)?;
        let total = stream.total_len.or(self.expected_size).unwrap_or(0);
        let mut downloaded = stream.offset;
        let mut throttle = ProgressThrottle::default();
        let pump = BodyPump::start(stream.reader, self.buffer_size)?;

        self.observers.emit(DownloadProgress::new(downloaded, total));
        while let Some(data) = pump.next(token, self.idle_timeout)? {
            file.write_all(&data).map_err(|e| {
                PatchflowError::download_failed(NAME, format!("Failed to write payload: {}", e))
            })?;
            downloaded += data.len() as u64;

            if throttle.should_emit() {
                self.observers.emit(DownloadProgress::new(downloaded, total));
            }
        }
        file.flush().map_err(|e| {
            PatchflowError::download_failed(NAME, format!("Failed to flush payload: {}", e))
        })?;
        self.observers.emit(DownloadProgress::new(downloaded, total.max(downloaded)));

        if let Some(expected) = self.expected_size {
            if downloaded != expected {
                return Err(PatchflowError::download_failed(
                    NAME,
                    format!("expected {} bytes, got {}", expected, downloaded),
                ));
            }
        }
        Ok(())
    }

    fn verify(&self) -> Result<(), PatchflowError> {
        let Some(chunks) = &self.chunks else {
            return Ok(());
        };
        let corrupt = first_corrupt_chunk(&self.destination, chunks).map_err(|e| {
            PatchflowError::download_failed(NAME, format!("Failed to verify payload: {}", e))
        })?;
        if let Some(index) = corrupt {
            let _ = fs::remove_file(&self.destination);
            return Err(PatchflowError::download_failed(
                NAME,
                format!("chunk {} failed verification", index),
            ));
        }
        Ok(())
    }
}

/// Open `path` for writing at `offset`, truncating anything after it.
fn open_at(path: &Path, offset: u64) -> Result<File, PatchflowError> {
    let io_err =
        |e: std::io::Error| PatchflowError::download_failed(NAME, format!("Failed to open {}: {}", path.display(), e));

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    if offset == 0 {
        return File::create(path).map_err(io_err);
    }
    let file = OpenOptions::new().append(true).open(path).map_err(io_err)?;
    file.set_len(offset).map_err(io_err)?;
    Ok(file)
}

impl ContentDownloader for HttpDownloader {
    fn name(&self) -> &'static str {
        NAME
    }

    fn progress(&self) -> &ProgressObservers {
        &self.observers
    }

    fn download(&mut self, token: &CancellationToken) -> Result<PathBuf, PatchflowError> {
        let _enter = self.span.enter();
        cancel::ensure_not_cancelled(token)?;

        if self.urls.is_empty() {
            return Err(PatchflowError::download_failed(NAME, "no download urls"));
        }
        if let Some(chunks) = &self.chunks {
            validate_chunks(chunks)?;
        }

        let mut last_error = None;
        for url in &self.urls {
            match self.download_from(url, token).and_then(|()| self.verify()) {
                Ok(()) => {
                    info!(url = %url.url, "Download finished");
                    return Ok(self.destination.clone());
                }
                Err(_) if token.is_cancelled() => {
                    info!("Download cancelled, partial data kept for resume");
                    return Err(PatchflowError::OperationCancelled);
                }
                Err(e) => {
                    warn!(url = %url.url, error = %e, "Mirror failed");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e @ PatchflowError::DownloadFailed { .. }) => e,
            Some(e) => PatchflowError::download_failed(NAME, e.to_string()),
            None => PatchflowError::download_failed(NAME, "no mirror succeeded"),
        })
    }
}
