//! Patchflow error types.

use thiserror::Error;

/// Classification of a non-success status returned by a remote API.
///
/// License handling branches on this enum instead of raw codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    /// 403: the service refuses to answer for this application.
    Forbidden,
    /// 404: the requested resource does not exist.
    NotFound,
    /// 410: the resource existed but has been revoked.
    Gone,
    /// Any other non-success status.
    Other(u16),
}

impl RemoteStatus {
    /// Classify a raw HTTP status code.
    pub fn from_code(code: u16) -> Self {
        match code {
            403 => Self::Forbidden,
            404 => Self::NotFound,
            410 => Self::Gone,
            other => Self::Other(other),
        }
    }

    /// The raw HTTP status code.
    pub fn code(&self) -> u16 {
        match self {
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Gone => 410,
            Self::Other(code) => *code,
        }
    }

    /// Whether the status is a server-side fault (5xx).
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.code())
    }
}

impl std::fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors that can occur while resolving, validating or downloading an update.
#[derive(Debug, Error)]
pub enum PatchflowError {
    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A local precondition was violated (caller bug, never retried).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Network-layer fault on a single request (unreachable, timeout, DNS).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The retry strategy gave up on a remote endpoint.
    #[error("Remote service unavailable after {attempts} attempt(s): {last_error}")]
    RemoteUnavailable {
        /// Number of attempts made.
        attempts: u32,
        /// Description of the last failure.
        last_error: String,
    },

    /// The remote service answered with a non-success status.
    #[error("Remote service responded with status {status}: {message}")]
    RemoteResponse {
        /// Classified status.
        status: RemoteStatus,
        /// Response body or reason.
        message: String,
    },

    /// The remote service reports the requested resource as absent.
    #[error("Remote resource not found: {0}")]
    RemoteNotFound(String),

    /// Malformed or unexpected response.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The shared cancellation token was observed cancelled.
    #[error("Operation cancelled")]
    OperationCancelled,

    /// A downloader variant hit an unrecoverable fault.
    #[error("{downloader} download failed: {cause}")]
    DownloadFailed {
        /// Downloader variant name.
        downloader: &'static str,
        /// Cause of the failure.
        cause: String,
    },

    /// The patch-application sink rejected a payload.
    #[error("Patch application failed: {0}")]
    PatchFailed(String),

    /// Local filesystem error outside of a download.
    #[error("I/O error: {0}")]
    Io(String),
}

impl PatchflowError {
    /// Whether this error is the cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::OperationCancelled)
    }

    /// Whether this error is a network-layer fault rather than a remote answer.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RemoteUnavailable { .. })
    }

    /// Classified remote status, if the remote service answered.
    pub fn remote_status(&self) -> Option<RemoteStatus> {
        match self {
            Self::RemoteResponse { status, .. } => Some(*status),
            Self::RemoteNotFound(_) => Some(RemoteStatus::NotFound),
            _ => None,
        }
    }

    pub(crate) fn download_failed(downloader: &'static str, cause: impl Into<String>) -> Self {
        Self::DownloadFailed {
            downloader,
            cause: cause.into(),
        }
    }
}
