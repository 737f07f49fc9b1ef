//! Test doubles for the transport and dialog seams.
//!
//! Only compiled for tests or with the `test-seams` feature.

use crate::cancel::CancellationToken;
use crate::client::http::{HttpClient, HttpResponse, HttpStream};
use crate::license::{LicenseDialog, LicenseDialogResult, LicenseMessage};
use crate::PatchflowError;
use reqwest::Url;
use std::collections::{HashMap, VecDeque};
use std::io::{Cursor, Read, Write};
use std::net::TcpListener;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
enum FakeResponse {
    Body { status: u16, body: Vec<u8> },
    TransportError(String),
}

#[derive(Debug, Clone)]
struct FakePayload {
    bytes: Vec<u8>,
    supports_ranges: bool,
}

/// Scripted [`HttpClient`] keyed by URL path.
///
/// Each path holds a queue of responses; the last queued response repeats
/// once the others are consumed. Unknown paths answer 404.
#[derive(Debug, Default)]
pub struct FakeHttpClient {
    responses: Mutex<HashMap<String, VecDeque<FakeResponse>>>,
    payloads: Mutex<HashMap<String, FakePayload>>,
    requests: Mutex<Vec<String>>,
    read_delay: Mutex<Option<Duration>>,
}

impl FakeHttpClient {
    /// Create an empty fake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response with `status` and `body` for `path`.
    pub fn push_json(&self, path: &str, status: u16, body: &str) {
        self.push(
            path,
            FakeResponse::Body {
                status,
                body: body.as_bytes().to_vec(),
            },
        );
    }

    /// Queue a network-layer failure for `path`.
    pub fn push_transport_error(&self, path: &str, message: &str) {
        self.push(path, FakeResponse::TransportError(message.to_string()));
    }

    /// Serve `bytes` as a downloadable payload at `path`.
    pub fn set_payload(&self, path: &str, bytes: Vec<u8>, supports_ranges: bool) {
        if let Ok(mut payloads) = self.payloads.lock() {
            payloads.insert(
                path.to_string(),
                FakePayload {
                    bytes,
                    supports_ranges,
                },
            );
        }
    }

    /// Slow every streamed read down to simulate a long transfer.
    pub fn set_read_delay(&self, delay: Duration) {
        if let Ok(mut slot) = self.read_delay.lock() {
            *slot = Some(delay);
        }
    }

    /// Number of requests made to `path` (buffered and streamed).
    pub fn request_count(&self, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|url| path_of(url) == path)
            .count()
    }

    /// Total number of requests made.
    pub fn total_requests(&self) -> usize {
        self.requests().len()
    }

    /// Every requested URL, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn push(&self, path: &str, response: FakeResponse) {
        if let Ok(mut responses) = self.responses.lock() {
            responses
                .entry(path.to_string())
                .or_default()
                .push_back(response);
        }
    }

    fn record(&self, url: &str) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(url.to_string());
        }
    }

    fn next_response(&self, path: &str) -> Option<FakeResponse> {
        let mut responses = self.responses.lock().ok()?;
        let queue = responses.get_mut(path)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

fn path_of(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

impl HttpClient for FakeHttpClient {
    fn get(&self, url: &str, _timeout: Duration) -> Result<HttpResponse, PatchflowError> {
        self.record(url);
        match self.next_response(&path_of(url)) {
            Some(FakeResponse::Body { status, body }) => Ok(HttpResponse { status, body }),
            Some(FakeResponse::TransportError(message)) => Err(PatchflowError::Transport(message)),
            None => {
                let payload = self
                    .payloads
                    .lock()
                    .ok()
                    .and_then(|p| p.get(&path_of(url)).cloned());
                match payload {
                    Some(payload) => Ok(HttpResponse {
                        status: 200,
                        body: payload.bytes,
                    }),
                    None => Ok(HttpResponse {
                        status: 404,
                        body: b"no fake response".to_vec(),
                    }),
                }
            }
        }
    }

    fn get_stream(&self, url: &str, offset: u64) -> Result<HttpStream, PatchflowError> {
        self.record(url);
        let path = path_of(url);
        if let Some(FakeResponse::TransportError(message)) = self.next_response(&path) {
            return Err(PatchflowError::Transport(message));
        }

        let payload = self.payloads.lock().ok().and_then(|p| p.get(&path).cloned());
        let Some(payload) = payload else {
            return Ok(HttpStream {
                status: 404,
                offset: 0,
                total_len: None,
                reader: Box::new(Cursor::new(Vec::new())),
            });
        };

        let total = payload.bytes.len() as u64;
        let (status, start) = if offset > 0 && payload.supports_ranges && offset <= total {
            (206, offset)
        } else {
            (200, 0)
        };
        let body = payload.bytes[start as usize..].to_vec();
        let delay = self.read_delay.lock().ok().and_then(|d| *d);

        Ok(HttpStream {
            status,
            offset: start,
            total_len: Some(total),
            reader: Box::new(SlowReader {
                inner: Cursor::new(body),
                delay,
            }),
        })
    }
}

/// Reader that hands out small slices, optionally sleeping before each.
struct SlowReader {
    inner: Cursor<Vec<u8>>,
    delay: Option<Duration>,
}

impl Read for SlowReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let limit = buf.len().min(1024);
        self.inner.read(&mut buf[..limit])
    }
}

/// Serve one HTTP response on a local socket, slowly.
///
/// Announces `content_length`, writes `body` in pieces of `piece` bytes with
/// `pause` after each, then keeps the connection open for `hold`. Returns the
/// URL to request.
pub fn serve_trickle(
    content_length: usize,
    body: Vec<u8>,
    piece: usize,
    pause: Duration,
    hold: Duration,
) -> std::io::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let url = format!("http://{}/payload.bin", listener.local_addr()?);

    std::thread::spawn(move || {
        let Ok((mut socket, _)) = listener.accept() else {
            return;
        };
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            match socket.read(&mut byte) {
                Ok(1) => request.push(byte[0]),
                _ => return,
            }
        }

        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            content_length
        );
        if socket.write_all(head.as_bytes()).is_err() {
            return;
        }
        for part in body.chunks(piece.max(1)) {
            if socket.write_all(part).and_then(|()| socket.flush()).is_err() {
                return;
            }
            std::thread::sleep(pause);
        }
        std::thread::sleep(hold);
    });

    Ok(url)
}

/// Dialog that replays a fixed list of results and records what it showed.
///
/// Once the script runs out it answers `Aborted`.
#[derive(Debug, Default)]
pub struct ScriptedLicenseDialog {
    results: Mutex<VecDeque<LicenseDialogResult>>,
    shown: Mutex<Vec<LicenseMessage>>,
}

impl ScriptedLicenseDialog {
    /// Create a dialog replaying `results` in order.
    pub fn new(results: impl IntoIterator<Item = LicenseDialogResult>) -> Self {
        Self {
            results: Mutex::new(results.into_iter().collect()),
            shown: Mutex::new(Vec::new()),
        }
    }

    /// Messages of every presentation so far.
    pub fn shown(&self) -> Vec<LicenseMessage> {
        self.shown.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl LicenseDialog for ScriptedLicenseDialog {
    fn display(
        &self,
        message: LicenseMessage,
        _token: &CancellationToken,
    ) -> Result<LicenseDialogResult, PatchflowError> {
        if let Ok(mut shown) = self.shown.lock() {
            shown.push(message);
        }
        let next = self
            .results
            .lock()
            .ok()
            .and_then(|mut results| results.pop_front());
        Ok(next.unwrap_or(LicenseDialogResult::Aborted))
    }
}
