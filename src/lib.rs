//! # Patchflow
//!
//! **Client-side update pipeline for remotely published application versions.**
//!
//! Patchflow asks a metadata service which version is current, confirms the
//! user's license when the application requires one, downloads the full
//! content or the chain of diffs needed to reach that version, and hands each
//! payload to a host-provided patch sink.
//!
//! ## Features
//!
//! - **Cancellable everywhere**: every blocking call takes a [`CancellationToken`]
//! - **Retrying metadata client** with growing per-attempt timeouts
//! - **Torrent downloads with HTTP fallback**, resumable and chunk-verified
//! - **Interactive license loop** driven by a host dialog
//!
//! ## Quickstart
//!
//! ```no_run
//! use patchflow::{
//!     CancellationToken, PatchflowConfig, RemoteMetadataService, UpdateOrchestrator,
//!     UpdateRequest,
//! };
//! use patchflow::client::http::ReqwestHttpClient;
//! use patchflow::client::policy::SimpleRequestTimeoutCalculator;
//! use std::sync::Arc;
//!
//! # fn dialog() -> Arc<dyn patchflow::LicenseDialog> { unimplemented!() }
//! # fn sink() -> Arc<dyn patchflow::PatchSink> { unimplemented!() }
//! fn main() -> Result<(), patchflow::PatchflowError> {
//!     let config = PatchflowConfig::new("your-app-secret");
//!     let metadata = RemoteMetadataService::new(
//!         &config,
//!         Arc::new(SimpleRequestTimeoutCalculator::default()),
//!     )?;
//!     let http = Arc::new(ReqwestHttpClient::new(config.user_agent())?);
//!
//!     let orchestrator = UpdateOrchestrator::new(config, metadata, http, dialog(), sink())?;
//!     let token = CancellationToken::new();
//!     let outcome = orchestrator.run(&UpdateRequest::default(), &token)?;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```
//!
//! See [`PatchflowConfig`] for the tunables.

#![deny(warnings)]
#![deny(missing_docs)]

// Core modules
pub mod cancel;
pub mod config;
pub mod errors;
pub mod types;

// Protocol layer
pub mod protocol;

// Client layer
pub mod client;
pub mod metadata;

// Downloaders
pub mod download;

// License validation
pub mod license;

// Orchestrator (main public API)
pub mod orchestrator;

#[cfg(any(test, feature = "test-seams"))]
pub mod testing;

// Re-exports for public API
pub use cancel::CancellationToken;
pub use config::{DownloadStrategy, PatchflowConfig};
pub use download::{ContentDownloader, DownloadProgress, ProgressObservers};
pub use errors::{PatchflowError, RemoteStatus};
pub use license::{LicenseDialog, LicenseDialogResult, LicenseMessage, LicenseValidator};
pub use metadata::{PayloadKind, RemoteMetadataService};
pub use orchestrator::{
    Payload, PatchSink, TorrentEngineFactory, UpdateOrchestrator, UpdateOutcome, UpdateRequest,
    VersionTarget,
};
pub use types::{AppSecret, KeySecret, VersionId};
