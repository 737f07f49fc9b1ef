//! Content downloaders.
//!
//! Every variant streams one version payload to a local file, reports
//! progress to its observers and observes cancellation at each chunk or
//! poll boundary. A downloader only reports the outcome of its own attempt;
//! choosing another variant on failure is the orchestrator's call.

pub mod checksum;
pub mod http;
pub mod progress;
pub mod torrent;

use crate::cancel::CancellationToken;
use crate::PatchflowError;
use std::path::PathBuf;

pub use progress::{DownloadProgress, ProgressObservers, SubscriptionId};

/// Contract shared by all downloader variants.
pub trait ContentDownloader: Send {
    /// Variant name used in errors and logs.
    fn name(&self) -> &'static str;

    /// Observers notified of progress while `download` runs.
    fn progress(&self) -> &ProgressObservers;

    /// Retrieve the payload, blocking until it is complete.
    ///
    /// Returns the path of the finished file. Fails with
    /// `OperationCancelled` when `token` fires and `DownloadFailed` on an
    /// unrecoverable fault. No progress is emitted after this returns.
    fn download(&mut self, token: &CancellationToken) -> Result<PathBuf, PatchflowError>;
}
