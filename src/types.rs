//! Identifiers and credentials shared across the pipeline.

use crate::PatchflowError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer identifier of a release.
pub type VersionId = i32;

/// Check that a version id can be sent to the catalog.
///
/// Ids are assigned by the service starting at 1, so zero and negative
/// values are caller bugs.
pub fn validate_version_id(version_id: VersionId) -> Result<(), PatchflowError> {
    if version_id <= 0 {
        return Err(PatchflowError::InvalidArgument(format!(
            "version id must be greater than zero, got {}",
            version_id
        )));
    }
    Ok(())
}

/// Opaque credential identifying the application to the remote services.
#[derive(Clone, PartialEq, Eq)]
pub struct AppSecret(String);

impl AppSecret {
    /// Create an app secret, rejecting empty or blank values.
    pub fn new(value: impl Into<String>) -> Result<Self, PatchflowError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(PatchflowError::InvalidArgument(
                "app secret cannot be empty".to_string(),
            ));
        }
        Ok(Self(value))
    }

    /// The raw secret.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AppSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AppSecret({})", redact(&self.0))
    }
}

/// Credential unlocking a licensed version.
///
/// Never persisted by this crate; callers own any caching.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeySecret(String);

impl KeySecret {
    /// Wrap a key secret.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw secret.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySecret({})", redact(&self.0))
    }
}

/// Keep a short prefix for log correlation, hide the rest.
///
/// Values of eight characters or fewer are hidden entirely.
pub(crate) fn redact(value: &str) -> String {
    if value.chars().count() <= 8 {
        return "***".to_string();
    }
    let prefix: String = value.chars().take(4).collect();
    format!("{}***", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_id_validation() {
        assert!(validate_version_id(1).is_ok());
        assert!(validate_version_id(42).is_ok());
        assert!(matches!(
            validate_version_id(0),
            Err(PatchflowError::InvalidArgument(_))
        ));
        assert!(matches!(
            validate_version_id(-7),
            Err(PatchflowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_app_secret_rejects_empty() {
        assert!(matches!(
            AppSecret::new(""),
            Err(PatchflowError::InvalidArgument(_))
        ));
        assert!(AppSecret::new("   ").is_err());
        assert_eq!(AppSecret::new("abc123").unwrap().as_str(), "abc123");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let app = AppSecret::new("0123456789abcdef").unwrap();
        let key = KeySecret::new("ks-secret-value");

        assert_eq!(format!("{:?}", app), "AppSecret(0123***)");
        assert_eq!(format!("{:?}", key), "KeySecret(ks-s***)");
    }

    #[test]
    fn test_short_secrets_are_fully_hidden() {
        assert_eq!(format!("{:?}", KeySecret::new("ks")), "KeySecret(***)");
        assert_eq!(redact("12345678"), "***");
        assert_eq!(redact("123456789"), "1234***");
        assert_eq!(redact(""), "***");
    }

    #[test]
    fn test_key_secret_serde_transparent() {
        let key: KeySecret = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(key.as_str(), "abc");
    }
}
