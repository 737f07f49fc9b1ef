//! Remote metadata façade over the catalog and keys APIs.
//!
//! Translates application-level questions (latest version, app info,
//! content and diff summaries, key secrets) into API calls. Retries are
//! entirely the business of each connection's injected strategy:
//! - catalog: infinite retry, lookups must eventually succeed
//! - keys: no retry, rejections must reach license validation at once

use crate::cancel::CancellationToken;
use crate::client::connection::ApiConnection;
use crate::client::http::{HttpClient, ReqwestHttpClient};
use crate::client::policy::{
    InfiniteRequestRetryStrategy, NoRequestRetryStrategy, RequestRetryStrategy,
    RequestTimeoutCalculator,
};
use crate::config::PatchflowConfig;
use crate::errors::RemoteStatus;
use crate::protocol::models::{
    AppInfo, AppVersion, AppVersionId, ContentSummary, DiffSummary, KeyInfo, ResourceUrl,
    TorrentUrl,
};
use crate::types::{redact, validate_version_id, AppSecret, KeySecret, VersionId};
use crate::PatchflowError;
use std::sync::Arc;
use tracing::{debug, info_span, Span};

/// Which payload of a version a lookup refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Full content of the version.
    Content,
    /// Delta from the previous version.
    Diff,
}

impl PayloadKind {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Diff => "diff",
        }
    }
}

/// Façade over the catalog ("main") and licensing ("keys") APIs.
pub struct RemoteMetadataService {
    app_secret: AppSecret,
    main: ApiConnection,
    keys: ApiConnection,
    span: Span,
}

impl RemoteMetadataService {
    /// Create the service from config, using the reqwest transport.
    ///
    /// Fails with `InvalidArgument` on an empty app secret before any
    /// connection is built.
    pub fn new(
        config: &PatchflowConfig,
        timeouts: Arc<dyn RequestTimeoutCalculator>,
    ) -> Result<Self, PatchflowError> {
        config.validate()?;
        let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new(config.user_agent())?);
        Self::with_http(config, http, timeouts)
    }

    /// Create the service over a caller-supplied transport.
    pub fn with_http(
        config: &PatchflowConfig,
        http: Arc<dyn HttpClient>,
        timeouts: Arc<dyn RequestTimeoutCalculator>,
    ) -> Result<Self, PatchflowError> {
        Self::with_retry_strategy(
            config,
            http,
            timeouts,
            Box::new(InfiniteRequestRetryStrategy::default()),
        )
    }

    /// Create the service with a custom catalog retry strategy.
    ///
    /// The keys connection never retries regardless of this argument.
    pub fn with_retry_strategy(
        config: &PatchflowConfig,
        http: Arc<dyn HttpClient>,
        timeouts: Arc<dyn RequestTimeoutCalculator>,
        main_retry: Box<dyn RequestRetryStrategy>,
    ) -> Result<Self, PatchflowError> {
        let app_secret = AppSecret::new(config.app_secret.clone())?;

        let main = ApiConnection::new(
            "main",
            &config.main_api_url,
            Arc::clone(&http),
            Arc::clone(&timeouts),
            main_retry,
        )?;
        let keys = ApiConnection::new(
            "keys",
            &config.keys_api_url,
            http,
            timeouts,
            Box::new(NoRequestRetryStrategy),
        )?;

        let span = info_span!("remote_metadata", app = %redact(app_secret.as_str()));

        Ok(Self {
            app_secret,
            main,
            keys,
            span,
        })
    }

    /// Log under `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// The application secret shared by all calls.
    pub fn app_secret(&self) -> &AppSecret {
        &self.app_secret
    }

    /// Id of the newest published version.
    pub fn get_latest_version_id(
        &self,
        token: &CancellationToken,
    ) -> Result<VersionId, PatchflowError> {
        let _enter = self.span.enter();
        debug!("Getting latest version id.");

        let url = self.main.url(&self.app_path(&["versions", "latest", "id"]), &[]);
        let response: AppVersionId = self.main.get_json(&url, token)?;
        validate_version_id(response.id).map_err(|_| {
            PatchflowError::ProtocolError(format!(
                "catalog returned invalid latest version id {}",
                response.id
            ))
        })?;
        Ok(response.id)
    }

    /// Newest published version, including its changelog.
    pub fn get_latest_version(
        &self,
        token: &CancellationToken,
    ) -> Result<AppVersion, PatchflowError> {
        let _enter = self.span.enter();
        debug!("Getting latest version.");

        let url = self.main.url(&self.app_path(&["versions", "latest"]), &[]);
        self.main.get_json(&url, token)
    }

    /// Top-level application metadata.
    pub fn get_app_info(&self, token: &CancellationToken) -> Result<AppInfo, PatchflowError> {
        let _enter = self.span.enter();
        debug!("Getting app info.");

        let url = self.main.url(&self.app_path(&[]), &[]);
        self.main.get_json(&url, token)
    }

    /// Summary of a version's full payload.
    pub fn get_content_summary(
        &self,
        version_id: VersionId,
        token: &CancellationToken,
    ) -> Result<ContentSummary, PatchflowError> {
        validate_version_id(version_id)?;
        let _enter = self.span.enter();
        debug!(version_id, "Getting content summary.");

        self.get_version_resource(version_id, "content_summary", None, token)
    }

    /// Summary of a version's incremental delta.
    pub fn get_diff_summary(
        &self,
        version_id: VersionId,
        token: &CancellationToken,
    ) -> Result<DiffSummary, PatchflowError> {
        validate_version_id(version_id)?;
        let _enter = self.span.enter();
        debug!(version_id, "Getting diff summary.");

        self.get_version_resource(version_id, "diff_summary", None, token)
    }

    /// Mirror URLs serving a version's payload.
    pub fn get_resource_urls(
        &self,
        version_id: VersionId,
        kind: PayloadKind,
        key_secret: Option<&KeySecret>,
        token: &CancellationToken,
    ) -> Result<Vec<ResourceUrl>, PatchflowError> {
        validate_version_id(version_id)?;
        let _enter = self.span.enter();
        debug!(version_id, ?kind, "Getting resource urls.");

        let resource = format!("{}_urls", kind.prefix());
        self.get_version_resource(version_id, &resource, key_secret, token)
    }

    /// URL of the `.torrent` file describing a version's payload.
    pub fn get_torrent_url(
        &self,
        version_id: VersionId,
        kind: PayloadKind,
        key_secret: Option<&KeySecret>,
        token: &CancellationToken,
    ) -> Result<String, PatchflowError> {
        validate_version_id(version_id)?;
        let _enter = self.span.enter();
        debug!(version_id, ?kind, "Getting torrent url.");

        let resource = format!("{}_torrent_url", kind.prefix());
        let response: TorrentUrl =
            self.get_version_resource(version_id, &resource, key_secret, token)?;
        Ok(response.url)
    }

    /// Exchange a license key for its key secret.
    ///
    /// `cached_key_secret` lets the keys service short-circuit
    /// re-validation. Rejections surface as `RemoteResponse` with the
    /// classified status; transport faults are not retried.
    pub fn get_key_secret(
        &self,
        key: &str,
        cached_key_secret: Option<&KeySecret>,
        token: &CancellationToken,
    ) -> Result<KeySecret, PatchflowError> {
        if key.trim().is_empty() {
            return Err(PatchflowError::InvalidArgument(
                "license key cannot be empty".to_string(),
            ));
        }
        let _enter = self.span.enter();
        debug!(key = %redact(key), cached = cached_key_secret.is_some(), "Getting key secret.");

        let url = self.keys.url(
            &["v2", "keys", key],
            &[
                ("app_secret", Some(self.app_secret.as_str())),
                ("key_secret", cached_key_secret.map(KeySecret::as_str)),
            ],
        );
        let info: KeyInfo = self.keys.get_json(&url, token)?;
        if info.blocked {
            return Err(PatchflowError::RemoteResponse {
                status: RemoteStatus::Gone,
                message: "license key is blocked".to_string(),
            });
        }
        Ok(info.key_secret)
    }

    fn app_path<'a>(&'a self, rest: &[&'a str]) -> Vec<&'a str> {
        let mut segments = vec!["1", "apps", self.app_secret.as_str()];
        segments.extend_from_slice(rest);
        segments
    }

    fn get_version_resource<T: serde::de::DeserializeOwned>(
        &self,
        version_id: VersionId,
        resource: &str,
        key_secret: Option<&KeySecret>,
        token: &CancellationToken,
    ) -> Result<T, PatchflowError> {
        let id = version_id.to_string();
        let url = self.main.url(
            &self.app_path(&["versions", &id, resource]),
            &[("key_secret", key_secret.map(KeySecret::as_str))],
        );
        self.main.get_json(&url, token).map_err(|e| match e {
            PatchflowError::RemoteResponse {
                status: RemoteStatus::NotFound,
                ..
            } => PatchflowError::RemoteNotFound(format!("{} of version {}", resource, version_id)),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::policy::SimpleRequestTimeoutCalculator;
    use crate::testing::FakeHttpClient;

    const APP: &str = "/1/apps/secret";

    fn service(http: Arc<FakeHttpClient>) -> RemoteMetadataService {
        let config = PatchflowConfig::new("secret");
        RemoteMetadataService::with_http(
            &config,
            http,
            Arc::new(SimpleRequestTimeoutCalculator::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_app_secret_rejected_without_network() {
        let http = Arc::new(FakeHttpClient::new());
        let config = PatchflowConfig::new("");
        let result = RemoteMetadataService::with_http(
            &config,
            http.clone(),
            Arc::new(SimpleRequestTimeoutCalculator::default()),
        );
        assert!(matches!(result, Err(PatchflowError::InvalidArgument(_))));
        assert_eq!(http.total_requests(), 0);
    }

    #[test]
    fn test_new_rejects_empty_secret() {
        let result = RemoteMetadataService::new(
            &PatchflowConfig::new(""),
            Arc::new(SimpleRequestTimeoutCalculator::default()),
        );
        assert!(matches!(result, Err(PatchflowError::InvalidArgument(_))));
    }

    #[test]
    fn test_latest_version_id() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_json(&format!("{}/versions/latest/id", APP), 200, r#"{"id": 12}"#);

        let id = service(http)
            .get_latest_version_id(&CancellationToken::new())
            .unwrap();
        assert_eq!(id, 12);
    }

    #[test]
    fn test_latest_version_id_rejects_invalid_id() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_json(&format!("{}/versions/latest/id", APP), 200, r#"{"id": 0}"#);

        let result = service(http).get_latest_version_id(&CancellationToken::new());
        assert!(matches!(result, Err(PatchflowError::ProtocolError(_))));
    }

    #[test]
    fn test_latest_version_changelog() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_json(
            &format!("{}/versions/latest", APP),
            200,
            r#"{"id": 3, "label": "1.0.3", "changelog": "Bug fixes"}"#,
        );

        let version = service(http)
            .get_latest_version(&CancellationToken::new())
            .unwrap();
        assert_eq!(version.changelog.as_deref(), Some("Bug fixes"));
    }

    #[test]
    fn test_app_info_is_idempotent() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_json(APP, 200, r#"{"name": "game", "use_keys": true}"#);
        let service = service(http.clone());
        let token = CancellationToken::new();

        let first = service.get_app_info(&token).unwrap();
        let second = service.get_app_info(&token).unwrap();
        assert_eq!(first, second);
        assert!(first.use_keys);
        assert_eq!(http.request_count(APP), 2);
    }

    #[test]
    fn test_invalid_version_id_fails_before_network() {
        let http = Arc::new(FakeHttpClient::new());
        let service = service(http.clone());
        let token = CancellationToken::new();

        for id in [-1, 0] {
            assert!(matches!(
                service.get_content_summary(id, &token),
                Err(PatchflowError::InvalidArgument(_))
            ));
            assert!(matches!(
                service.get_diff_summary(id, &token),
                Err(PatchflowError::InvalidArgument(_))
            ));
        }
        assert_eq!(http.total_requests(), 0);
    }

    #[test]
    fn test_missing_version_is_remote_not_found() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_json(&format!("{}/versions/99/content_summary", APP), 404, "");

        let result = service(http).get_content_summary(99, &CancellationToken::new());
        assert!(matches!(result, Err(PatchflowError::RemoteNotFound(_))));
    }

    #[test]
    fn test_diff_summary() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_json(
            &format!("{}/versions/4/diff_summary", APP),
            200,
            r#"{"size": 77, "modified_files": ["a.bin"]}"#,
        );

        let summary = service(http)
            .get_diff_summary(4, &CancellationToken::new())
            .unwrap();
        assert_eq!(summary.size, 77);
        assert_eq!(summary.modified_files, vec!["a.bin"]);
    }

    #[test]
    fn test_resource_urls_carry_key_secret() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_json(
            &format!("{}/versions/2/content_urls", APP),
            200,
            r#"[{"url": "https://cdn.example.com/v2.zip", "country": "PL"}]"#,
        );

        let urls = service(http.clone())
            .get_resource_urls(
                2,
                PayloadKind::Content,
                Some(&KeySecret::new("ks")),
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(urls.len(), 1);
        assert!(http.requests()[0].ends_with("content_urls?key_secret=ks"));
    }

    #[test]
    fn test_torrent_url() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_json(
            &format!("{}/versions/2/diff_torrent_url", APP),
            200,
            r#"{"url": "https://cdn.example.com/v2.torrent"}"#,
        );

        let url = service(http)
            .get_torrent_url(2, PayloadKind::Diff, None, &CancellationToken::new())
            .unwrap();
        assert_eq!(url, "https://cdn.example.com/v2.torrent");
    }

    #[test]
    fn test_key_secret_passes_cached_hint() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_json("/v2/keys/KEY-1", 200, r#"{"key_secret": "fresh"}"#);

        let secret = service(http.clone())
            .get_key_secret("KEY-1", Some(&KeySecret::new("old")), &CancellationToken::new())
            .unwrap();
        assert_eq!(secret.as_str(), "fresh");

        let request = &http.requests()[0];
        assert!(request.starts_with("https://keys2.patchkit.net/v2/keys/KEY-1?"));
        assert!(request.contains("app_secret=secret"));
        assert!(request.contains("key_secret=old"));
    }

    #[test]
    fn test_key_secret_rejection_is_not_retried() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_json("/v2/keys/BAD", 404, "unknown key");
        http.push_transport_error("/v2/keys/DOWN", "unreachable");
        let service = service(http.clone());
        let token = CancellationToken::new();

        let rejected = service.get_key_secret("BAD", None, &token).unwrap_err();
        assert_eq!(rejected.remote_status(), Some(RemoteStatus::NotFound));
        assert_eq!(http.request_count("/v2/keys/BAD"), 1);

        let down = service.get_key_secret("DOWN", None, &token).unwrap_err();
        assert!(down.is_transport());
        assert_eq!(http.request_count("/v2/keys/DOWN"), 1);
    }

    #[test]
    fn test_blocked_key_is_gone() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_json("/v2/keys/K", 200, r#"{"key_secret": "x", "blocked": true}"#);

        let err = service(http)
            .get_key_secret("K", None, &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.remote_status(), Some(RemoteStatus::Gone));
    }

    #[test]
    fn test_empty_key_is_invalid_argument() {
        let http = Arc::new(FakeHttpClient::new());
        let result = service(http.clone()).get_key_secret("", None, &CancellationToken::new());
        assert!(matches!(result, Err(PatchflowError::InvalidArgument(_))));
        assert_eq!(http.total_requests(), 0);
    }
}
