//! HTTP Client Abstraction
//!
//! Provides async HTTP operations for the download queue: streamed audio fetches
//! with optional byte ranges, plus small buffered requests.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// HTTP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
}

/// HTTP request builder
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Request the resource starting at `offset` (open-ended byte range).
    pub fn range_from(self, offset: u64) -> Self {
        self.header("Range", format!("bytes={}-", offset))
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }
}

/// Buffered HTTP response
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    /// Check if response status is successful (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Declared `Content-Length`, if the server sent one.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.parse().ok())
    }

    /// Turn a non-2xx response into an error.
    pub fn error_for_status(self, url: &str) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(BridgeError::HttpStatus {
                status: self.status,
                url: url.to_string(),
            })
        }
    }
}

/// Streamed response body.
///
/// `content_length` is the size announced by the server and is what progress
/// reporting uses as the denominator when known.
pub struct DownloadStream {
    pub content_length: Option<u64>,
    pub reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
}

impl DownloadStream {
    pub fn new(
        content_length: Option<u64>,
        reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    ) -> Self {
        Self {
            content_length,
            reader,
        }
    }

    /// Wrap an in-memory body. Handy for fakes and tests.
    pub fn from_bytes(bytes: Bytes) -> Self {
        let len = bytes.len() as u64;
        Self::new(Some(len), Box::new(std::io::Cursor::new(bytes)))
    }
}

impl fmt::Debug for DownloadStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadStream")
            .field("content_length", &self.content_length)
            .finish()
    }
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, exponential and capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Async HTTP client trait
///
/// Implementations should handle connection pooling, TLS validation and
/// transport-level timeouts. Application-level retry of audio downloads is
/// done by the download queue, so `download_stream` must not retry on its own.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::http::{HttpClient, HttpRequest};
///
/// async fn fetch(client: &dyn HttpClient) -> Result<u64> {
///     let stream = client.download_stream(HttpRequest::get("https://cdn/track.hi")).await?;
///     Ok(stream.content_length.unwrap_or(0))
/// }
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Execute a buffered HTTP request
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// Execute a buffered HTTP request with a custom retry policy
    async fn execute_with_retry(
        &self,
        request: HttpRequest,
        policy: RetryPolicy,
    ) -> Result<HttpResponse> {
        let _ = policy;
        self.execute(request).await
    }

    /// Open a streamed download.
    ///
    /// Returns an error for non-2xx statuses before any body is read.
    async fn download_stream(&self, request: HttpRequest) -> Result<DownloadStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_http_request_builder() {
        let request = HttpRequest::get("https://cdn.example.com/a.hi")
            .header("User-Agent", "test")
            .range_from(1024)
            .timeout(Duration::from_secs(30));

        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(request.headers.get("Range"), Some(&"bytes=1024-".to_string()));
        assert_eq!(request.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_content_length_header() {
        let mut headers = HashMap::new();
        headers.insert("Content-Length".to_string(), "4096".to_string());
        let response = HttpResponse {
            status: 200,
            headers,
            body: Bytes::new(),
        };

        assert!(response.is_success());
        assert_eq!(response.content_length(), Some(4096));
    }

    #[test]
    fn test_error_for_status() {
        let response = HttpResponse {
            status: 404,
            headers: HashMap::new(),
            body: Bytes::new(),
        };
        let err = response.error_for_status("https://cdn/x").unwrap_err();
        assert!(matches!(err, BridgeError::HttpStatus { status: 404, .. }));
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(6), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_download_stream_from_bytes() {
        let mut stream = DownloadStream::from_bytes(Bytes::from_static(b"abcdef"));
        assert_eq!(stream.content_length, Some(6));

        let mut buf = Vec::new();
        stream.reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"abcdef");
    }
}
