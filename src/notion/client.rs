//! Notion API Client
//!
//! Provides authenticated, cancellable access to one Notion database:
//! cursor pagination over the database query endpoint, page detail lookups,
//! and a uniform retry policy for rate limits and transient network failures.

use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::errors::UpstreamError;
use super::types::{Block, ListResponse, QueryRequest, RawBlock, RawPage, UpstreamItem};

/// Notion API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.notion.com/v1";

/// API version pinned via the `Notion-Version` header
pub const API_VERSION: &str = "2022-06-28";

/// HTTP client timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Page size for block children listings (API maximum)
const BLOCK_PAGE_SIZE: u32 = 100;

/// Retry budget and back-off bounds applied to every request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Wait before the first retry when the server gives no hint
    pub initial_backoff: Duration,
    /// Upper bound for the doubled back-off
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Exponential back-off state for one request
#[derive(Debug)]
struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    fn new(policy: &RetryPolicy) -> Self {
        Self {
            current: policy.initial_backoff,
            max: policy.max_backoff,
        }
    }

    /// Delay before the next attempt; a server hint wins over the computed value.
    /// The computed value doubles either way.
    fn next_delay(&mut self, hint: Option<Duration>) -> Duration {
        let delay = hint.unwrap_or(self.current);
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

/// Notion API client bound to a single database
#[derive(Clone)]
pub struct NotionClient {
    /// HTTP client for making requests
    http_client: Client,
    /// API root, overridable for tests and proxies
    base_url: String,
    /// Integration token sent as a bearer credential
    api_key: String,
    /// Database queried by `fetch_all_items`
    database_id: String,
    retry: RetryPolicy,
}

impl std::fmt::Debug for NotionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotionClient")
            .field("base_url", &self.base_url)
            .field("database_id", &self.database_id)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl NotionClient {
    /// Create a client for one database
    ///
    /// # Arguments
    /// * `api_key` - Notion integration token
    /// * `database_id` - Database holding the served items
    /// * `request_timeout` - Bound on every individual HTTP call
    pub fn new(api_key: &str, database_id: &str, request_timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.to_string(),
            database_id: database_id.to_string(),
            retry: RetryPolicy::default(),
        })
    }

    /// Point the client at a different API root
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Replace the retry policy
    #[cfg(test)]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fetch every item of the database, following cursors until the end.
    ///
    /// All pages are accumulated in memory before returning. Cancellation
    /// aborts between or during page requests and surfaces as
    /// [`UpstreamError::Cancelled`].
    pub async fn fetch_all_items(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<UpstreamItem>, UpstreamError> {
        let url = format!(
            "{}/databases/{}/query",
            self.base_url,
            urlencoding::encode(&self.database_id)
        );
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(UpstreamError::Cancelled);
            }

            let request = QueryRequest {
                start_cursor: cursor.take(),
            };
            debug!(start = ?request.start_cursor, "Querying Notion database");

            let body = serde_json::to_vec(&request)
                .map_err(|e| UpstreamError::Decode(format!("encode query: {e}")))?;
            let page: ListResponse<RawPage> = self
                .request_json(
                    Method::POST,
                    &url,
                    Some(Bytes::from(body)),
                    cancel,
                    "query_database",
                )
                .await?;
            pages += 1;

            let next = page.continuation().map(String::from);
            items.extend(page.results.into_iter().map(UpstreamItem::from));

            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        info!(count = items.len(), pages = pages, "Fetched items from Notion");
        Ok(items)
    }

    /// Fetch one item with its content blocks
    pub async fn fetch_item_detail(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<UpstreamItem, UpstreamError> {
        let encoded = urlencoding::encode(id);
        let url = format!("{}/pages/{}", self.base_url, encoded);
        let page: RawPage = self
            .request_json(Method::GET, &url, None, cancel, "get_page")
            .await?;

        let mut item = UpstreamItem::from(page);
        item.content_blocks = self.fetch_block_children(&encoded, cancel).await?;

        debug!(id = id, blocks = item.content_blocks.len(), "Fetched item detail");
        Ok(item)
    }

    /// List the direct children of a block, following cursors
    async fn fetch_block_children(
        &self,
        block_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Block>, UpstreamError> {
        let mut blocks = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut url = format!(
                "{}/blocks/{}/children?page_size={}",
                self.base_url, block_id, BLOCK_PAGE_SIZE
            );
            if let Some(cursor) = cursor.take() {
                url.push_str("&start_cursor=");
                url.push_str(&urlencoding::encode(&cursor));
            }

            let page: ListResponse<RawBlock> = self
                .request_json(Method::GET, &url, None, cancel, "get_block_children")
                .await?;

            let next = page.continuation().map(String::from);
            blocks.extend(page.results.into_iter().map(Block::from));

            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(blocks)
    }

    /// Send a request through the retry loop and decode the JSON body
    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<Bytes>,
        cancel: &CancellationToken,
        operation: &str,
    ) -> Result<T, UpstreamError> {
        let bytes = self.send_with_retry(method, url, body, cancel, operation).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| UpstreamError::Decode(format!("{operation}: {e}")))
    }

    /// Execute a request with retry logic and exponential back-off.
    ///
    /// Rate limits and transient network failures are retried until the
    /// attempt budget runs out; any other non-2xx response fails at once.
    /// The body is buffered up front so it can be resent on every attempt.
    async fn send_with_retry(
        &self,
        method: Method,
        url: &str,
        body: Option<Bytes>,
        cancel: &CancellationToken,
        operation: &str,
    ) -> Result<Bytes, UpstreamError> {
        let mut backoff = Backoff::new(&self.retry);
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_failure = String::new();

        for attempt in 1..=max_attempts {
            let mut request = self
                .http_client
                .request(method.clone(), url)
                .bearer_auth(&self.api_key)
                .header("Notion-Version", API_VERSION)
                .header(CONTENT_TYPE, "application/json");
            if let Some(body) = &body {
                request = request.body(body.clone());
            }

            let sent = tokio::select! {
                _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                sent = request.send() => sent,
            };

            let hint = match sent {
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    last_failure = "rate limited (HTTP 429)".to_string();
                    retry_after(response.headers())
                }
                Ok(response) if !response.status().is_success() => {
                    let status = response.status();
                    let text = tokio::select! {
                        _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                        text = response.text() => text.unwrap_or_default(),
                    };
                    return Err(UpstreamError::from_status(status.as_u16(), &text));
                }
                Ok(response) => {
                    let read = tokio::select! {
                        _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                        read = response.bytes() => read,
                    };
                    match read {
                        Ok(bytes) => {
                            debug!(
                                operation = operation,
                                size = bytes.len(),
                                "Notion API response"
                            );
                            return Ok(bytes);
                        }
                        Err(e) => {
                            last_failure = transient_failure(UpstreamError::Transport(e))?;
                            None
                        }
                    }
                }
                Err(e) => {
                    last_failure = transient_failure(UpstreamError::Transport(e))?;
                    None
                }
            };

            if attempt == max_attempts {
                break;
            }

            let delay = backoff.next_delay(hint);
            warn!(
                operation = operation,
                attempt = attempt,
                max = max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %last_failure,
                "Retrying Notion operation"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        warn!(
            operation = operation,
            attempts = max_attempts,
            error = %last_failure,
            "Notion operation failed after retries"
        );
        Err(UpstreamError::RetriesExhausted {
            attempts: max_attempts,
            last: last_failure,
        })
    }
}

/// Describe a retryable error; any other error is handed back to fail the call
fn transient_failure(err: UpstreamError) -> Result<String, UpstreamError> {
    if err.is_transient() {
        Ok(err.to_string())
    } else {
        Err(err)
    }
}

/// Parse the numeric `Retry-After` hint (seconds, fractional allowed)
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs: f64 = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    if secs.is_finite() && (0.0..=f64::from(u32::MAX)).contains(&secs) {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}
