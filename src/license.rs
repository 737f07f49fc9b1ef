//! Interactive license validation.
//!
//! The validator is an explicit state machine:
//!
//! ```text
//! CheckingAppInfo ─(no keys)─────────────────────────────▶ Resolved(None)
//!        │
//!        ▼
//! AwaitingUserInput(msg) ─(Aborted / token)──────────────▶ Aborted
//!        │ Confirmed(key)
//!        ▼
//! ValidatingKey ─ ok ────────────────────────────────────▶ Resolved(Some)
//!        │ 404 / 410 / 403 / transport
//!        ├──────────────▶ AwaitingUserInput(new msg)
//!        │ anything else
//!        └──────────────────────────────────────────────▶ Failed
//! ```
//!
//! The loop is user-paced and has no iteration cap. It is cancellable at
//! every iteration boundary.

use crate::cancel::CancellationToken;
use crate::errors::RemoteStatus;
use crate::metadata::RemoteMetadataService;
use crate::types::KeySecret;
use crate::PatchflowError;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Span};

/// Message shown by the license dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LicenseMessage {
    /// First presentation, nothing to report.
    #[default]
    None,
    /// The key was not recognised.
    InvalidLicense,
    /// The key has been revoked.
    BlockedLicense,
    /// The licensing service could not be reached or refused to answer.
    ServiceUnavailable,
}

/// What the user did with the dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LicenseDialogResult {
    /// The user entered a key.
    Confirmed(String),
    /// The user gave up.
    Aborted,
}

/// Interactive license dialog provided by the host UI.
pub trait LicenseDialog: Send + Sync {
    /// Show the dialog with `message` and block until the user answers.
    ///
    /// Implementations should return `OperationCancelled` promptly once
    /// `token` fires.
    fn display(
        &self,
        message: LicenseMessage,
        token: &CancellationToken,
    ) -> Result<LicenseDialogResult, PatchflowError>;
}

/// States of the validation loop.
#[derive(Debug)]
enum State {
    CheckingAppInfo,
    AwaitingUserInput(LicenseMessage),
    ValidatingKey(String),
    Resolved(Option<KeySecret>),
    Aborted,
    Failed(PatchflowError),
}

/// Outcome of a rejected key: ask again with a message, or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRejection {
    /// Show the dialog again with this message.
    Retry(LicenseMessage),
    /// Unknown failure, escalate.
    Fatal,
}

/// Map a key lookup failure to the next dialog message.
///
/// 404 and 410 describe the key; 403 and network faults describe the
/// service. Anything else (429 included) escalates.
pub fn classify_key_failure(error: &PatchflowError) -> KeyRejection {
    if error.is_transport() {
        return KeyRejection::Retry(LicenseMessage::ServiceUnavailable);
    }
    match error.remote_status() {
        Some(RemoteStatus::NotFound) => KeyRejection::Retry(LicenseMessage::InvalidLicense),
        Some(RemoteStatus::Gone) => KeyRejection::Retry(LicenseMessage::BlockedLicense),
        Some(RemoteStatus::Forbidden) => KeyRejection::Retry(LicenseMessage::ServiceUnavailable),
        _ => KeyRejection::Fatal,
    }
}

/// Runs the interactive license confirmation against the keys service.
pub struct LicenseValidator<'a> {
    metadata: &'a RemoteMetadataService,
    dialog: Arc<dyn LicenseDialog>,
    cached_key_secret: Option<KeySecret>,
    span: Span,
}

impl<'a> LicenseValidator<'a> {
    /// Create a validator using `dialog` for user input.
    pub fn new(metadata: &'a RemoteMetadataService, dialog: Arc<dyn LicenseDialog>) -> Self {
        Self {
            metadata,
            dialog,
            cached_key_secret: None,
            span: info_span!("validate_license"),
        }
    }

    /// Offer a previously obtained key secret as a hint for the first lookup.
    ///
    /// The hint is dropped after the first rejection.
    pub fn with_cached_key_secret(mut self, cached: Option<KeySecret>) -> Self {
        self.cached_key_secret = cached;
        self
    }

    /// Log under `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Run the loop to completion.
    ///
    /// Returns `None` when the application does not use keys, the key
    /// secret otherwise. Fails with `OperationCancelled` when the user aborts
    /// or the token fires.
    pub fn execute(&self, token: &CancellationToken) -> Result<Option<KeySecret>, PatchflowError> {
        let _enter = self.span.enter();
        let mut cached = self.cached_key_secret.clone();
        let mut state = State::CheckingAppInfo;

        loop {
            state = match state {
                State::Resolved(secret) => {
                    info!(licensed = secret.is_some(), "License resolved");
                    return Ok(secret);
                }
                State::Aborted => {
                    info!("License entry aborted");
                    return Err(PatchflowError::OperationCancelled);
                }
                State::Failed(error) => return Err(error),
                _ if token.is_cancelled() => {
                    debug!("Cancelled between license steps");
                    State::Aborted
                }
                other => self.step(other, &mut cached, token),
            };
        }
    }

    /// Advance one non-terminal state.
    fn step(
        &self,
        state: State,
        cached: &mut Option<KeySecret>,
        token: &CancellationToken,
    ) -> State {
        match state {
            State::CheckingAppInfo => match self.metadata.get_app_info(token) {
                Ok(info) if !info.use_keys => {
                    debug!("Application does not use keys");
                    State::Resolved(None)
                }
                Ok(_) => State::AwaitingUserInput(LicenseMessage::None),
                Err(PatchflowError::OperationCancelled) => State::Aborted,
                Err(e) => State::Failed(e),
            },
            State::AwaitingUserInput(message) => {
                debug!(?message, "Displaying license dialog");
                match self.dialog.display(message, token) {
                    Ok(LicenseDialogResult::Confirmed(key)) => State::ValidatingKey(key),
                    Ok(LicenseDialogResult::Aborted) | Err(PatchflowError::OperationCancelled) => {
                        State::Aborted
                    }
                    Err(e) => State::Failed(e),
                }
            }
            State::ValidatingKey(key) if key.trim().is_empty() => {
                State::AwaitingUserInput(LicenseMessage::InvalidLicense)
            }
            State::ValidatingKey(key) => {
                match self.metadata.get_key_secret(&key, cached.as_ref(), token) {
                    Ok(secret) => State::Resolved(Some(secret)),
                    Err(PatchflowError::OperationCancelled) => State::Aborted,
                    Err(error) => match classify_key_failure(&error) {
                        KeyRejection::Retry(message) => {
                            warn!(error = %error, ?message, "License key rejected");
                            *cached = None;
                            State::AwaitingUserInput(message)
                        }
                        KeyRejection::Fatal => State::Failed(error),
                    },
                }
            }
            terminal => terminal,
        }
    }
}
