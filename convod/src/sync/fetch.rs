use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use convo_core::{ConversationPage, ConversationRecord, ConvoClient, ConvoError, UpdatedWindow};
use thiserror::Error;

use super::backoff::Backoff;
use super::range::TimeRange;
use super::rate_limit::TokenBucket;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Still failing after the retry budget; a later attempt may succeed.
    #[error("gave up after {attempts} attempts: {message}")]
    Transient { attempts: u32, message: String },
    #[error("{0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

/// Remote client wrapped in the shared token bucket and the retry policy.
#[derive(Clone)]
pub struct FetchClient {
    api: ConvoClient,
    limiter: TokenBucket,
    retry: RetryPolicy,
    page_size: u32,
    calls: Arc<AtomicU64>,
}

impl FetchClient {
    pub fn new(api: ConvoClient, limiter: TokenBucket, retry: RetryPolicy, page_size: u32) -> Self {
        Self {
            api,
            limiter,
            retry,
            page_size: page_size.max(1),
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Outbound requests issued so far, retries included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// One page of records updated within `range`, oldest first. `cursor` is
    /// handed to the remote exactly as it returned it.
    pub async fn fetch_page(
        &self,
        range: TimeRange,
        cursor: Option<&str>,
    ) -> Result<ConversationPage, FetchError> {
        let window = UpdatedWindow {
            start: range.start(),
            end: range.end(),
        };
        self.with_retry("search", || {
            self.api.search_conversations(window, cursor, self.page_size)
        })
        .await
    }

    pub async fn fetch_one(&self, id: &str) -> Result<Option<ConversationRecord>, FetchError> {
        self.with_retry("get", || self.api.get_conversation(id)).await
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ConvoError>>,
    {
        let mut retries = 0u32;
        loop {
            self.limiter.acquire().await;
            self.calls.fetch_add(1, Ordering::Relaxed);
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_retryable() {
                return Err(FetchError::Permanent(err.to_string()));
            }
            if retries >= self.retry.max_retries {
                return Err(FetchError::Transient {
                    attempts: retries + 1,
                    message: err.to_string(),
                });
            }
            let delay = self.retry.backoff.delay_for(retries, err.retry_after());
            retries += 1;
            tracing::warn!(
                op,
                attempt = retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying remote call"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
