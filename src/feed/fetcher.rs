use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    LAST_MODIFIED,
};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use thiserror::Error;

use crate::config::FetcherConfig;
use crate::storage::CacheHints;

const MAX_REDIRECTS: usize = 5;

/// Feed formats first, generic XML next, anything else last.
const FEED_ACCEPT: &str =
    "application/rss+xml, application/atom+xml, application/xml;q=0.9, text/xml;q=0.9, */*;q=0.8";

/// Errors that can occur while retrieving a feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// DNS, connect, TLS, timeout or mid-body transport failure
    #[error("Unreachable: {0}")]
    Unreachable(String),
    /// HTTP response with a non-2xx, non-304 status
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Server kept answering 429 Too Many Requests
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the configured size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Received fewer bytes than Content-Length announced
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Body and metadata of a successful (2xx) response.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    /// Validators to send on the next poll
    pub cache: CacheHints,
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Fetched(RawPayload),
    /// 304: the server confirmed our cached copy is current
    NotModified,
}

/// HTTP retrieval for feed sources. Cheap to clone; clones share the
/// connection pool.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    max_retries: u32,
    retry_base_delay: Duration,
    max_bytes: usize,
}

/// Redirect policy with a hop limit and loop detection.
fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("Too many redirects");
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Fetcher {
    pub fn new(config: &FetcherConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(FEED_ACCEPT));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .redirect(redirect_policy())
            .user_agent(config.user_agent.clone())
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_bytes: config.max_feed_bytes,
        })
    }

    /// Delay before retry number `attempt` (0-based): base * 2^attempt.
    fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }

    /// Fetch `url`, sending conditional headers from `hints` when present.
    ///
    /// 429, 5xx and truncated bodies are retried up to `max_retries` times with
    /// exponential delay; other 4xx statuses fail immediately.
    pub async fn fetch(&self, url: &str, hints: &CacheHints) -> Result<FetchOutcome, FetchError> {
        let mut retry_count = 0;

        loop {
            let mut request = self.client.get(url);
            if let Some(etag) = &hints.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = &hints.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified);
            }

            let response = request
                .send()
                .await
                .map_err(|e| FetchError::Unreachable(e.to_string()))?;
            let status = response.status();

            if status == StatusCode::NOT_MODIFIED {
                return Ok(FetchOutcome::NotModified);
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                if retry_count >= self.max_retries {
                    return Err(FetchError::RateLimited(self.max_retries));
                }
                let delay = self.retry_delay(retry_count);
                tracing::warn!(
                    url = %url,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            if status.is_server_error() {
                if retry_count >= self.max_retries {
                    return Err(FetchError::HttpStatus(status.as_u16()));
                }
                let delay = self.retry_delay(retry_count);
                tracing::warn!(
                    url = %url,
                    status = %status,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Server error, retrying after delay"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }

            let headers = response.headers();
            let content_type = header_string(headers, CONTENT_TYPE);
            let cache = CacheHints {
                etag: header_string(headers, ETAG),
                last_modified: header_string(headers, LAST_MODIFIED),
            };

            match read_limited_bytes(response, self.max_bytes).await {
                Ok(bytes) => {
                    return Ok(FetchOutcome::Fetched(RawPayload {
                        bytes,
                        content_type,
                        cache,
                    }));
                }
                Err(FetchError::IncompleteResponse { expected, received }) => {
                    if retry_count >= self.max_retries {
                        return Err(FetchError::IncompleteResponse { expected, received });
                    }
                    let delay = self.retry_delay(retry_count);
                    tracing::debug!(
                        url = %url,
                        expected = expected,
                        received = received,
                        attempt = retry_count + 1,
                        "Retrying incomplete download"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FetchError::Unreachable(e.to_string()))?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
