//! Transport client abstraction and its reqwest-based implementation.
//!
//! The rest of the crate only sees [`HttpClient`]; tests swap in a fake.
//! Non-success statuses are returned, not raised, so callers can classify
//! them. Only network-layer faults become `PatchflowError::Transport`.

use crate::PatchflowError;
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, CONTENT_LENGTH, RANGE, USER_AGENT};
use reqwest::StatusCode;
use std::io::Read;
use std::time::Duration;

/// Buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,

    /// Raw response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Get the body as a UTF-8 string (lossy, for error messages).
    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Streaming HTTP response for payload downloads.
pub struct HttpStream {
    /// HTTP status code.
    pub status: u16,

    /// Offset the body actually starts at. Zero when the server ignored
    /// the requested range.
    pub offset: u64,

    /// Total resource length, if the server reported it.
    pub total_len: Option<u64>,

    /// Body reader.
    pub reader: Box<dyn Read + Send>,
}

impl std::fmt::Debug for HttpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpStream")
            .field("status", &self.status)
            .field("offset", &self.offset)
            .field("total_len", &self.total_len)
            .finish_non_exhaustive()
    }
}

/// Performs HTTP-shaped GET requests.
pub trait HttpClient: Send + Sync {
    /// Fetch `url` and buffer the whole body.
    fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, PatchflowError>;

    /// Open `url` for streaming, asking the server to start at `offset`.
    ///
    /// The body is not bounded by a deadline: a payload may take as long as
    /// it needs while bytes keep arriving. Callers detect stalls themselves.
    fn get_stream(&self, url: &str, offset: u64) -> Result<HttpStream, PatchflowError>;
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Blocking reqwest client.
pub struct ReqwestHttpClient {
    client: Client,
    user_agent: String,
}

impl ReqwestHttpClient {
    /// Create a client sending the given User-Agent.
    ///
    /// The client carries no total timeout; buffered requests set their own
    /// and streams run unbounded.
    pub fn new(user_agent: impl Into<String>) -> Result<Self, PatchflowError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| PatchflowError::Transport(format!("Failed to create client: {}", e)))?;

        Ok(Self::from_client(client, user_agent))
    }

    /// Wrap a preconfigured client, e.g. one with custom proxies or roots.
    ///
    /// A total timeout configured on `client` also cuts long streams short.
    pub fn from_client(client: Client, user_agent: impl Into<String>) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
        }
    }

    fn send(&self, url: &str, offset: u64) -> Result<Response, PatchflowError> {
        let mut request = self.client.get(url).header(USER_AGENT, &self.user_agent);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        request
            .send()
            .map_err(|e| PatchflowError::Transport(format!("Request to {} failed: {}", url, e)))
    }
}

impl HttpClient for ReqwestHttpClient {
    fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, PatchflowError> {
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "application/json")
            .timeout(timeout)
            .send()
            .map_err(|e| PatchflowError::Transport(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map_err(|e| PatchflowError::Transport(format!("Failed to read body: {}", e)))?
            .to_vec();

        Ok(HttpResponse { status, body })
    }

    fn get_stream(&self, url: &str, offset: u64) -> Result<HttpStream, PatchflowError> {
        let response = self.send(url, offset)?;
        let status = response.status();
        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let (offset, total_len) = stream_bounds(status, offset, content_length);

        Ok(HttpStream {
            status: status.as_u16(),
            offset,
            total_len,
            reader: Box::new(response),
        })
    }
}

/// Work out where a (possibly ranged) body starts and how long the whole
/// resource is.
fn stream_bounds(
    status: StatusCode,
    requested_offset: u64,
    content_length: Option<u64>,
) -> (u64, Option<u64>) {
    if status == StatusCode::PARTIAL_CONTENT {
        (
            requested_offset,
            content_length.map(|len| requested_offset + len),
        )
    } else {
        (0, content_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::serve_trickle;

    #[test]
    fn test_response_success_range() {
        let ok = HttpResponse {
            status: 204,
            body: Vec::new(),
        };
        let missing = HttpResponse {
            status: 404,
            body: b"not found".to_vec(),
        };
        assert!(ok.is_success());
        assert!(!missing.is_success());
        assert_eq!(missing.body_lossy(), "not found");
    }

    #[test]
    fn test_stream_bounds_partial_content() {
        let (offset, total) = stream_bounds(StatusCode::PARTIAL_CONTENT, 100, Some(400));
        assert_eq!(offset, 100);
        assert_eq!(total, Some(500));
    }

    #[test]
    fn test_stream_bounds_range_ignored() {
        let (offset, total) = stream_bounds(StatusCode::OK, 100, Some(500));
        assert_eq!(offset, 0);
        assert_eq!(total, Some(500));
    }

    #[test]
    fn test_client_creation() {
        let client = ReqwestHttpClient::new("test-agent");
        assert!(client.is_ok());
    }

    fn local_client() -> ReqwestHttpClient {
        let client = Client::builder()
            .no_proxy()
            .timeout(None::<Duration>)
            .build()
            .unwrap();
        ReqwestHttpClient::from_client(client, "test-agent")
    }

    #[test]
    fn test_slow_stream_outlives_request_timeout() {
        let body: Vec<u8> = (0..30u8).collect();
        let url = serve_trickle(
            body.len(),
            body.clone(),
            1,
            Duration::from_millis(50),
            Duration::ZERO,
        )
        .unwrap();

        let client = local_client();
        let started = std::time::Instant::now();
        let mut stream = client.get_stream(&url, 0).unwrap();
        let mut received = Vec::new();
        stream.reader.read_to_end(&mut received).unwrap();

        assert_eq!(stream.status, 200);
        assert_eq!(stream.total_len, Some(30));
        assert_eq!(received, body);
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }

    #[test]
    fn test_buffered_get_honors_timeout() {
        let url = serve_trickle(
            10,
            vec![b'x'; 10],
            1,
            Duration::from_millis(200),
            Duration::ZERO,
        )
        .unwrap();

        let err = local_client()
            .get(&url, Duration::from_millis(300))
            .unwrap_err();
        assert!(err.is_transport());
    }
}
