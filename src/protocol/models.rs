//! Catalog and keys API response structs.

use crate::types::{KeySecret, VersionId};
use crate::PatchflowError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Response of the latest-version-id endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AppVersionId {
    /// Id of the newest published version.
    pub id: VersionId,
}

/// Top-level application metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    /// Internal application name.
    #[serde(default)]
    pub name: Option<String>,
    /// Name shown to users.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Publisher of the application.
    #[serde(default)]
    pub author: Option<String>,
    /// Whether downloads require a license key.
    #[serde(default)]
    pub use_keys: bool,
}

/// A single release with its changelog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppVersion {
    /// Version id.
    pub id: VersionId,
    /// Human-readable version label.
    #[serde(default)]
    pub label: Option<String>,
    /// Release notes.
    #[serde(default)]
    pub changelog: Option<String>,
    /// Publication time, sent as unix seconds.
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub publish_date: Option<DateTime<Utc>>,
}

/// File entry of a content summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFile {
    /// Path relative to the installation root.
    pub path: String,
    /// Content hash, if published.
    #[serde(default)]
    pub hash: Option<String>,
}

/// Chunk manifest of a payload: fixed-size chunks with hex SHA-256 hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunks {
    /// Size of every chunk but the last, in bytes.
    pub size: u64,
    /// Hex SHA-256 of each chunk, in order.
    #[serde(default)]
    pub hashes: Vec<String>,
}

/// Metadata of a version's full payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSummary {
    /// Payload size in bytes.
    pub size: u64,
    /// Encryption applied to the payload.
    #[serde(default)]
    pub encryption_method: Option<String>,
    /// Compression applied to the payload.
    #[serde(default)]
    pub compression_method: Option<String>,
    /// Hash of the whole payload.
    #[serde(default)]
    pub hash_code: Option<String>,
    /// Files the payload installs.
    #[serde(default)]
    pub files: Vec<ContentFile>,
    /// Chunk manifest for verification and resume.
    #[serde(default)]
    pub chunks: Option<Chunks>,
}

/// Metadata of a version's incremental delta from the previous version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    /// Payload size in bytes.
    pub size: u64,
    /// Encryption applied to the payload.
    #[serde(default)]
    pub encryption_method: Option<String>,
    /// Compression applied to the payload.
    #[serde(default)]
    pub compression_method: Option<String>,
    /// Hash of the whole payload.
    #[serde(default)]
    pub hash_code: Option<String>,
    /// Files the diff creates.
    #[serde(default)]
    pub added_files: Vec<String>,
    /// Files the diff patches.
    #[serde(default)]
    pub modified_files: Vec<String>,
    /// Files the diff deletes.
    #[serde(default)]
    pub removed_files: Vec<String>,
    /// Chunk manifest for verification and resume.
    #[serde(default)]
    pub chunks: Option<Chunks>,
}

/// One mirror of a downloadable resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUrl {
    /// Download URL.
    pub url: String,
    /// URL of the mirror's metadata file.
    #[serde(default)]
    pub meta_url: Option<String>,
    /// Country code of the mirror.
    #[serde(default)]
    pub country: Option<String>,
}

/// Response of the torrent-url endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct TorrentUrl {
    /// URL of the `.torrent` file.
    pub url: String,
}

/// Response of the keys API.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyInfo {
    /// Secret unlocking licensed downloads.
    pub key_secret: KeySecret,
    /// The key has been revoked.
    #[serde(default)]
    pub blocked: bool,
}

/// Parse a JSON body into the expected response type.
pub fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, PatchflowError> {
    serde_json::from_slice(body)
        .map_err(|e| PatchflowError::ProtocolError(format!("Failed to parse response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP_INFO: &str = r#"{
        "name": "my-game",
        "display_name": "My Game",
        "author": "Studio",
        "use_keys": true,
        "patcher_secret": "ignored"
    }"#;

    const CONTENT_SUMMARY: &str = r#"{
        "size": 2048,
        "encryption_method": "none",
        "compression_method": "zip",
        "hash_code": "abc",
        "files": [{"path": "game.exe", "hash": "123"}, {"path": "data/"}],
        "chunks": {"size": 1024, "hashes": ["aa", "bb"]}
    }"#;

    const DIFF_SUMMARY: &str = r#"{
        "size": 10,
        "added_files": ["new.dat"],
        "modified_files": ["game.exe"],
        "removed_files": []
    }"#;

    #[test]
    fn test_parse_app_info() {
        let info: AppInfo = parse_body(APP_INFO.as_bytes()).unwrap();
        assert!(info.use_keys);
        assert_eq!(info.display_name.as_deref(), Some("My Game"));
    }

    #[test]
    fn test_app_info_defaults_to_no_keys() {
        let info: AppInfo = parse_body(br#"{"name": "free"}"#).unwrap();
        assert!(!info.use_keys);
    }

    #[test]
    fn test_parse_content_summary() {
        let summary: ContentSummary = parse_body(CONTENT_SUMMARY.as_bytes()).unwrap();
        assert_eq!(summary.size, 2048);
        assert_eq!(summary.files.len(), 2);
        assert_eq!(summary.files[1].hash, None);
        let chunks = summary.chunks.unwrap();
        assert_eq!(chunks.size, 1024);
        assert_eq!(chunks.hashes, vec!["aa", "bb"]);
    }

    #[test]
    fn test_parse_diff_summary() {
        let summary: DiffSummary = parse_body(DIFF_SUMMARY.as_bytes()).unwrap();
        assert_eq!(summary.added_files, vec!["new.dat"]);
        assert!(summary.removed_files.is_empty());
        assert!(summary.chunks.is_none());
    }

    #[test]
    fn test_parse_version_with_publish_date() {
        let version: AppVersion = parse_body(
            br#"{"id": 7, "label": "1.2.0", "changelog": "Fixes", "publish_date": 1700000000}"#,
        )
        .unwrap();
        assert_eq!(version.id, 7);
        assert_eq!(version.changelog.as_deref(), Some("Fixes"));
        assert_eq!(version.publish_date.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_key_info() {
        let info: KeyInfo = parse_body(br#"{"key_secret": "s3cr3t"}"#).unwrap();
        assert_eq!(info.key_secret.as_str(), "s3cr3t");
        assert!(!info.blocked);
    }

    #[test]
    fn test_parse_malformed_json() {
        let result: Result<AppInfo, _> = parse_body(b"not json");
        assert!(matches!(result, Err(PatchflowError::ProtocolError(_))));
    }
}
