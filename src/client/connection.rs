//! A configured connection to one remote API.
//!
//! Each connection owns its base URL and retry strategy. The catalog and keys
//! APIs are two independent instances sharing only the transport and the
//! timeout calculator.

use crate::cancel::{self, CancellationToken};
use crate::client::http::HttpClient;
use crate::client::policy::{is_retryable, RequestRetryStrategy, RequestTimeoutCalculator};
use crate::errors::RemoteStatus;
use crate::protocol::models::parse_body;
use crate::PatchflowError;
use reqwest::Url;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, warn};

/// Connection to one remote API.
pub struct ApiConnection {
    name: &'static str,
    base_url: Url,
    http: Arc<dyn HttpClient>,
    timeouts: Arc<dyn RequestTimeoutCalculator>,
    retry: Box<dyn RequestRetryStrategy>,
}

impl ApiConnection {
    /// Create a connection to the API rooted at `base_url`.
    pub fn new(
        name: &'static str,
        base_url: &str,
        http: Arc<dyn HttpClient>,
        timeouts: Arc<dyn RequestTimeoutCalculator>,
        retry: Box<dyn RequestRetryStrategy>,
    ) -> Result<Self, PatchflowError> {
        let base_url = Url::parse(base_url).map_err(|e| {
            PatchflowError::ConfigError(format!("invalid {} API url '{}': {}", name, base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(PatchflowError::ConfigError(format!(
                "{} API url '{}' cannot be a base",
                name, base_url
            )));
        }

        Ok(Self {
            name,
            base_url,
            http,
            timeouts,
            retry,
        })
    }

    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Build a request URL from percent-encoded path segments and query pairs.
    ///
    /// Query pairs with a `None` value are omitted.
    pub fn url(&self, segments: &[&str], query: &[(&str, Option<&str>)]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        let present: Vec<(&str, &str)> = query
            .iter()
            .filter_map(|(k, v)| v.map(|v| (*k, v)))
            .collect();
        if !present.is_empty() {
            url.query_pairs_mut().extend_pairs(present);
        }
        url
    }

    /// GET `url` and decode the JSON body, retrying per the strategy.
    ///
    /// Between attempts the wait is cancellable. A non-success status is
    /// surfaced as `RemoteResponse` once the strategy declines to retry.
    pub fn get_json<T: DeserializeOwned>(
        &self,
        url: &Url,
        token: &CancellationToken,
    ) -> Result<T, PatchflowError> {
        let mut attempt: u32 = 0;
        loop {
            cancel::ensure_not_cancelled(token)?;
            attempt += 1;

            let timeout = self.timeouts.timeout(attempt);
            debug!(api = self.name, %url, attempt, ?timeout, "Sending request");

            let http = Arc::clone(&self.http);
            let target = url.to_string();
            let outcome = cancel::run_blocking(token, timeout, move || http.get(&target, timeout));
            let error = match outcome {
                Ok(response) if response.is_success() => return parse_body(&response.body),
                Ok(response) => PatchflowError::RemoteResponse {
                    status: RemoteStatus::from_code(response.status),
                    message: response.body_lossy(),
                },
                Err(PatchflowError::OperationCancelled) => {
                    return Err(PatchflowError::OperationCancelled)
                }
                Err(e) => e,
            };

            match self.retry.next_delay(attempt, &error) {
                Some(delay) => {
                    warn!(api = self.name, attempt, ?delay, error = %error, "Request failed, retrying");
                    cancel::sleep(token, delay)?;
                }
                None if attempt > 1 && is_retryable(&error) => {
                    return Err(PatchflowError::RemoteUnavailable {
                        attempts: attempt,
                        last_error: error.to_string(),
                    });
                }
                None => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::policy::{
        InfiniteRequestRetryStrategy, LimitedRequestRetryStrategy, NoRequestRetryStrategy,
        SimpleRequestTimeoutCalculator,
    };
    use crate::client::http::{HttpResponse, HttpStream};
    use crate::testing::FakeHttpClient;
    use serde::Deserialize;
    use std::time::{Duration, Instant};

    #[derive(Debug, Deserialize)]
    struct Id {
        id: i32,
    }

    fn connection(
        http: Arc<FakeHttpClient>,
        retry: Box<dyn RequestRetryStrategy>,
    ) -> ApiConnection {
        ApiConnection::new(
            "test",
            "https://api.example.com",
            http,
            Arc::new(SimpleRequestTimeoutCalculator::default()),
            retry,
        )
        .unwrap()
    }

    fn fast_infinite() -> Box<dyn RequestRetryStrategy> {
        Box::new(InfiniteRequestRetryStrategy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        })
    }

    #[test]
    fn test_invalid_base_url() {
        let result = ApiConnection::new(
            "test",
            "not a url",
            Arc::new(FakeHttpClient::new()),
            Arc::new(SimpleRequestTimeoutCalculator::default()),
            Box::new(NoRequestRetryStrategy),
        );
        assert!(matches!(result, Err(PatchflowError::ConfigError(_))));
    }

    #[test]
    fn test_url_encodes_segments_and_query() {
        let conn = connection(Arc::new(FakeHttpClient::new()), Box::new(NoRequestRetryStrategy));
        let url = conn.url(
            &["v2", "keys", "AB CD/EF"],
            &[("app_secret", Some("s")), ("key_secret", None)],
        );
        assert_eq!(
            url.as_str(),
            "https://api.example.com/v2/keys/AB%20CD%2FEF?app_secret=s"
        );
    }

    #[test]
    fn test_get_json_success() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_json("/id", 200, r#"{"id": 5}"#);
        let conn = connection(http.clone(), Box::new(NoRequestRetryStrategy));

        let id: Id = conn
            .get_json(&conn.url(&["id"], &[]), &CancellationToken::new())
            .unwrap();
        assert_eq!(id.id, 5);
        assert_eq!(http.request_count("/id"), 1);
    }

    #[test]
    fn test_no_retry_surfaces_status() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_json("/id", 404, "missing");
        let conn = connection(http.clone(), Box::new(NoRequestRetryStrategy));

        let result: Result<Id, _> = conn.get_json(&conn.url(&["id"], &[]), &CancellationToken::new());
        assert!(matches!(
            result,
            Err(PatchflowError::RemoteResponse {
                status: RemoteStatus::NotFound,
                ..
            })
        ));
        assert_eq!(http.request_count("/id"), 1);
    }

    #[test]
    fn test_no_retry_keeps_transport_error() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_transport_error("/id", "connection refused");
        let conn = connection(http, Box::new(NoRequestRetryStrategy));

        let result: Result<Id, _> = conn.get_json(&conn.url(&["id"], &[]), &CancellationToken::new());
        assert!(matches!(result, Err(PatchflowError::Transport(_))));
    }

    #[test]
    fn test_infinite_retry_recovers() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_transport_error("/id", "timeout");
        http.push_json("/id", 502, "bad gateway");
        http.push_json("/id", 200, r#"{"id": 9}"#);
        let conn = connection(http.clone(), fast_infinite());

        let id: Id = conn
            .get_json(&conn.url(&["id"], &[]), &CancellationToken::new())
            .unwrap();
        assert_eq!(id.id, 9);
        assert_eq!(http.request_count("/id"), 3);
    }

    #[test]
    fn test_infinite_retry_does_not_retry_client_errors() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_json("/id", 404, "missing");
        let conn = connection(http.clone(), fast_infinite());

        let result: Result<Id, _> = conn.get_json(&conn.url(&["id"], &[]), &CancellationToken::new());
        assert!(result.is_err());
        assert_eq!(http.request_count("/id"), 1);
    }

    #[test]
    fn test_limited_retry_exhaustion_is_unavailable() {
        let http = Arc::new(FakeHttpClient::new());
        for _ in 0..3 {
            http.push_transport_error("/id", "unreachable");
        }
        let conn = connection(
            http.clone(),
            Box::new(LimitedRequestRetryStrategy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            }),
        );

        let result: Result<Id, _> = conn.get_json(&conn.url(&["id"], &[]), &CancellationToken::new());
        assert!(matches!(
            result,
            Err(PatchflowError::RemoteUnavailable { attempts: 3, .. })
        ));
    }

    #[test]
    fn test_cancelled_before_request() {
        let http = Arc::new(FakeHttpClient::new());
        let conn = connection(http.clone(), fast_infinite());
        let token = CancellationToken::new();
        token.cancel();

        let result: Result<Id, _> = conn.get_json(&conn.url(&["id"], &[]), &token);
        assert!(matches!(result, Err(PatchflowError::OperationCancelled)));
        assert_eq!(http.total_requests(), 0);
    }

    #[test]
    fn test_malformed_body_is_protocol_error() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_json("/id", 200, "{oops");
        let conn = connection(http, Box::new(NoRequestRetryStrategy));

        let result: Result<Id, _> = conn.get_json(&conn.url(&["id"], &[]), &CancellationToken::new());
        assert!(matches!(result, Err(PatchflowError::ProtocolError(_))));
    }

    struct HangingHttp;

    impl HttpClient for HangingHttp {
        fn get(&self, _url: &str, _timeout: Duration) -> Result<HttpResponse, PatchflowError> {
            std::thread::sleep(Duration::from_secs(10));
            Err(PatchflowError::Transport("timed out".to_string()))
        }

        fn get_stream(&self, _url: &str, _offset: u64) -> Result<HttpStream, PatchflowError> {
            Err(PatchflowError::Transport("unused".to_string()))
        }
    }

    #[test]
    fn test_cancel_during_request() {
        let conn = ApiConnection::new(
            "test",
            "https://api.example.com",
            Arc::new(HangingHttp),
            Arc::new(SimpleRequestTimeoutCalculator::default()),
            Box::new(NoRequestRetryStrategy),
        )
        .unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            canceller.cancel();
        });

        let started = Instant::now();
        let result: Result<Id, _> = conn.get_json(&conn.url(&["id"], &[]), &token);

        assert!(matches!(result, Err(PatchflowError::OperationCancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
